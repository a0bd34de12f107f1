//! The management HTTP API (§6.1): instance CRUD, lifecycle verbs, health,
//! version, and log tailing.
//!
//! Manual `match (method, path)` dispatch with `path.starts_with`/
//! `path.split('/')` segment extraction rather than a router crate.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::InstanceOptions;
use crate::error::Error;
use crate::manager::Manager;
use crate::openai::full_body;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

pub struct ApiServer {
    bind_addr: SocketAddr,
    manager: Arc<Manager>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, manager: Arc<Manager>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            manager,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "management API listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let manager = Arc::clone(&manager);
                                    async move { Ok::<_, hyper::Error>(handle_request(req, manager).await) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(%addr, error = %e, "management API connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept management API connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("management API shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Renders the current snapshot of `name` as the response body, per §6.1's
/// "200/201 snapshot" success shape on the CRUD and lifecycle routes.
fn snapshot_response(manager: &Manager, name: &str, status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    match manager.get(name) {
        Some(instance) => {
            let body = serde_json::to_string(&instance.snapshot()).unwrap_or_else(|_| "{}".into());
            json_response(status, body)
        }
        None => Error::NotFound { name: name.to_string() }.into_response(),
    }
}

fn parse_logs_query(req: &Request<Incoming>) -> usize {
    lines_from_query(req.uri().query()).unwrap_or(100)
}

fn lines_from_query(query: Option<&str>) -> Option<usize> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("lines="))
        .and_then(|v| v.parse::<usize>().ok())
}

async fn read_json_body<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, Error> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|_| Error::ValidationError {
            message: "failed to read request body".into(),
        })?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| Error::ValidationError {
        message: format!("invalid JSON body: {e}"),
    })
}

async fn handle_request(
    req: Request<Incoming>,
    manager: Arc<Manager>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "management API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/api/v1/health") => json_response(StatusCode::OK, r#"{"status":"ok"}"#),
        (&Method::GET, "/api/v1/version") => {
            let body = serde_json::json!({ "name": PKG_NAME, "version": VERSION }).to_string();
            json_response(StatusCode::OK, body)
        }

        (&Method::GET, "/api/v1/instances") => {
            let body = serde_json::to_string(&manager.list()).unwrap_or_else(|_| "[]".into());
            json_response(StatusCode::OK, body)
        }

        (_, path) if path.starts_with("/api/v1/instances/") => {
            route_instance_scoped(&method, path, req, manager).await
        }

        _ => Error::NotFound { name: path }.into_response(),
    }
}

async fn route_instance_scoped(
    method: &Method,
    path: &str,
    req: Request<Incoming>,
    manager: Arc<Manager>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let rest = path.trim_start_matches("/api/v1/instances/");
    let mut segments = rest.splitn(2, '/');
    let name = segments.next().unwrap_or_default().to_string();
    let action = segments.next();

    if name.is_empty() {
        return Error::NotFound { name: path.to_string() }.into_response();
    }

    match (method, action) {
        (&Method::GET, None) => match manager.get(&name) {
            Some(instance) => {
                let body = serde_json::to_string(&instance.snapshot()).unwrap_or_else(|_| "{}".into());
                json_response(StatusCode::OK, body)
            }
            None => Error::NotFound { name }.into_response(),
        },

        (&Method::POST, None) => match read_json_body::<InstanceOptions>(req).await {
            Ok(options) => match manager.create_instance(&name, options) {
                Ok(()) => snapshot_response(&manager, &name, StatusCode::CREATED),
                Err(e) => e.into_response(),
            },
            Err(e) => e.into_response(),
        },

        (&Method::PUT, None) => match read_json_body::<serde_json::Value>(req).await {
            Ok(patch) => match manager.update_options(&name, patch).await {
                Ok(()) => snapshot_response(&manager, &name, StatusCode::OK),
                Err(e) => e.into_response(),
            },
            Err(e) => e.into_response(),
        },

        (&Method::DELETE, None) => match manager.delete_instance(&name).await {
            Ok(()) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(full_body(Bytes::new()))
                .expect("valid response with StatusCode enum"),
            Err(e) => e.into_response(),
        },

        (&Method::POST, Some("start")) => match manager.start_instance(&name).await {
            Ok(()) => snapshot_response(&manager, &name, StatusCode::OK),
            Err(e) => e.into_response(),
        },

        (&Method::POST, Some("stop")) => match manager.stop_instance(&name).await {
            Ok(()) => snapshot_response(&manager, &name, StatusCode::OK),
            Err(e) => e.into_response(),
        },

        (&Method::POST, Some("restart")) => match manager.restart_instance(&name).await {
            Ok(()) => snapshot_response(&manager, &name, StatusCode::OK),
            Err(e) => e.into_response(),
        },

        (&Method::GET, Some("logs")) => {
            let lines = parse_logs_query(&req);
            match manager.get(&name) {
                Some(instance) => match instance.tail_log(lines) {
                    Ok(text) => Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", "text/plain")
                        .body(full_body(Bytes::from(text)))
                        .expect("valid response"),
                    Err(e) => e.into_response(),
                },
                None => Error::NotFound { name }.into_response(),
            }
        }

        _ => Error::NotFound {
            name: path.to_string(),
        }
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_query_parses_lines_param() {
        assert_eq!(lines_from_query(Some("lines=50")), Some(50));
        assert_eq!(lines_from_query(Some("foo=bar&lines=10")), Some(10));
        assert_eq!(lines_from_query(None), None);
        assert_eq!(lines_from_query(Some("foo=bar")), None);
    }
}
