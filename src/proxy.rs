//! The reverse proxy: per-instance passthrough plus OpenAI-compatible
//! routing, on-demand start, and last-activity tracking.
//!
//! The request pipeline is resolve target, make sure it's ready, forward,
//! record activity — routed by instance name rather than `Host`-header
//! hostname extraction (a path segment for `/proxy/*`, the JSON `model`
//! field for the OpenAI routes). Websocket upgrade handling is out of
//! scope; SSE/chunked bodies pass through unmodified since hyper streams
//! response bodies natively without special casing.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, CONNECTION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::manager::Manager;
use crate::openai::{self, full_body};
use crate::pool::ConnectionPool;

/// Headers meaningful only between one hop and the next (RFC 7230 §6.1);
/// stripped before forwarding so they aren't forwarded on our behalf.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers plus any header the request's own `Connection`
/// header names, per §4.3's "forward headers (except hop-by-hop)".
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()))
        .filter(|s| !s.is_empty())
        .collect();
    for header in HOP_BY_HOP_HEADERS {
        headers.remove(*header);
    }
    for header in named {
        headers.remove(header.as_str());
    }
}

const OPENAI_ROUTES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/rerank",
    "/v1/reranking",
];

pub struct ProxyServer {
    bind_addr: SocketAddr,
    manager: Arc<Manager>,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<Manager>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            pool,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "reverse proxy listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let pool = Arc::clone(&self.pool);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, manager, pool).await {
                                    debug!(%addr, error = %e, "proxy connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept proxy connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reverse proxy shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    manager: Arc<Manager>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let manager = Arc::clone(&manager);
        let pool = Arc::clone(&pool);
        async move { Ok::<_, hyper::Error>(handle_request(req, manager, pool).await) }
    });
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("proxy connection error: {e}"))?;
    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    manager: Arc<Manager>,
    pool: Arc<ConnectionPool>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let path = req.uri().path().to_string();

    if path == "/v1/models" && req.method() == Method::GET {
        let body = openai::models_list_json(&manager.list());
        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full_body(Bytes::from(body)))
            .expect("valid response");
    }

    if let Some(rest) = path.strip_prefix("/proxy/") {
        let mut segments = rest.splitn(2, '/');
        let name = segments.next().unwrap_or_default().to_string();
        let sub_path = segments.next().unwrap_or("");
        if name.is_empty() {
            return Error::ValidationError {
                message: "missing instance name in /proxy/{name}/...".into(),
            }
            .into_response();
        }
        let req = req.map(|b| b.boxed());
        return forward(&manager, &pool, &name, req, Some(format!("/{sub_path}"))).await;
    }

    if OPENAI_ROUTES.contains(&path.as_str()) && req.method() == Method::POST {
        let (req, body_bytes) = match openai::buffer_body(req).await {
            Ok(v) => v,
            Err(_) => {
                return Error::ValidationError {
                    message: "failed to read request body".into(),
                }
                .into_response()
            }
        };
        let Some(model) = openai::extract_model(&body_bytes) else {
            return Error::ValidationError {
                message: "request body missing \"model\" field".into(),
            }
            .into_response();
        };
        return forward(&manager, &pool, &model, req, None).await;
    }

    Error::NotFound {
        name: path.clone(),
    }
    .into_response()
}

/// Resolves `name` to a ready instance, forwards the request (optionally
/// rewriting the path to `override_path`), and touches the instance's
/// last-activity on completion.
async fn forward(
    manager: &Arc<Manager>,
    pool: &Arc<ConnectionPool>,
    name: &str,
    req: Request<BoxBody<Bytes, hyper::Error>>,
    override_path: Option<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let port = match manager.ensure_running(name).await {
        Ok(port) => port,
        Err(e) => return e.into_response(),
    };

    let mut req = req;
    if let Some(new_path) = override_path {
        let query = req.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
        if let Ok(uri) = format!("{new_path}{query}").parse() {
            *req.uri_mut() = uri;
        }
    }
    strip_hop_by_hop_headers(req.headers_mut());

    let result = pool.send_request(port, req).await;
    if let Some(instance) = manager.get(name) {
        instance.touch();
    }

    match result {
        Ok(resp) => {
            let (parts, body) = resp.into_parts();
            Response::from_parts(parts, body.map_err(hyper::Error::from).boxed())
        }
        Err(e) => {
            debug!(instance = %name, error = %e, "upstream forwarding failed");
            Error::UpstreamUnavailable {
                name: name.to_string(),
            }
            .into_response()
        }
    }
}
