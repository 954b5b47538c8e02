//! Connection pool for upstream HTTP connections
//!
//! All forwarded non-upgrade requests share one pooled client so repeated
//! requests to the same dev server reuse their connections.

use crate::config::ServerConfig;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        }
    }
}

/// Build the absolute upstream URI for a request path
pub fn upstream_uri(authority: &str, path_and_query: Option<&str>) -> String {
    format!("http://{}{}", authority, path_and_query.unwrap_or("/"))
}

/// A connection pool for HTTP connections to upstream dev servers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send a request to `authority` (`host:port`), keeping method, path,
    /// query, headers and body as given
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        authority: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = upstream_uri(
            authority,
            req.uri().path_and_query().map(|pq| pq.as_str()),
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_config_from_server_config() {
        let server = ServerConfig {
            pool_max_idle_per_host: 3,
            pool_idle_timeout_secs: 15,
            ..ServerConfig::default()
        };
        let config = PoolConfig::from(&server);
        assert_eq!(config.max_idle_per_host, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_upstream_uri() {
        assert_eq!(
            upstream_uri("localhost:3000", Some("/api/users?id=1")),
            "http://localhost:3000/api/users?id=1"
        );
        assert_eq!(upstream_uri("127.0.0.1:8080", None), "http://127.0.0.1:8080/");
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
    }
}
