//! Pooled HTTP client used for forwarding proxied requests to a resolved
//! instance port, and for remote-instance federation calls (§4.9).
//!
//! A pooled `hyper_util` legacy client with a `send_request`-rebuilds-the-
//! URI pattern. Health probing is a separate raw TCP check in
//! `instance.rs`, not routed through this pool.

use std::time::Duration;

use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build_http();
        Self { client }
    }

    /// Forwards `req` to `127.0.0.1:{port}` keeping method/headers/body,
    /// only the URI authority changes.
    pub async fn send_request(
        &self,
        port: u16,
        mut req: Request<BoxBody<Bytes, hyper::Error>>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let new_uri: Uri = format!("http://127.0.0.1:{port}{path_and_query}")
            .parse()
            .expect("well-formed loopback URI");
        *req.uri_mut() = new_uri;
        self.client.request(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_config_has_sane_bounds() {
        let config = PoolConfig::default();
        assert!(config.max_idle_per_host > 0);
        assert!(config.idle_timeout > Duration::ZERO);
    }
}
