//! Upstream client used when a rewrite rule points at another server
//!
//! Plain HTTP targets go through a pooled hyper client. HTTPS targets are
//! dialed per request through a rustls connector that trusts the local
//! listener certificate.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Error type for upstream requests
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("Connection error: {0}")]
    Connect(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Request build error: {0}")]
    RequestBuild(String),

    #[error("HTTPS target but no TLS connector configured")]
    NoTls,
}

/// Statistics for the upstream client
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub tls_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self, tls: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if tls {
            self.tls_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_tls_requests(&self) -> u64 {
        self.tls_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
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

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
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

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to the absolute `target` URL, keeping method, headers and body
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        target: &Uri,
        tls: Option<&TlsConnector>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let authority = target
            .authority()
            .ok_or_else(|| PoolError::RequestBuild(format!("missing authority in {}", target)))?
            .clone();
        let is_tls = target.scheme_str() == Some("https");

        let (parts, body) = req.into_parts();
        let uri = if is_tls {
            // HTTP/1.1 origin-form on a direct connection
            target
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .parse::<Uri>()
                .map_err(|e| PoolError::RequestBuild(e.to_string()))?
        } else {
            target.clone()
        };

        let mut builder = Request::builder().method(parts.method).uri(uri);
        for (key, value) in parts.headers.iter() {
            if key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        builder = builder.header(hyper::header::HOST, host);

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request(is_tls);

        let response = if is_tls {
            let connector = tls.ok_or(PoolError::NoTls)?;
            send_tls(upstream_req, &authority, connector).await?
        } else {
            self.client.request(upstream_req).await?
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

async fn send_tls(
    req: Request<Incoming>,
    authority: &hyper::http::uri::Authority,
    connector: &TlsConnector,
) -> Result<Response<Incoming>, PoolError> {
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let port = authority.port_u16().unwrap_or(443);

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| PoolError::RequestBuild(format!("invalid server name {}: {}", host, e)))?;

    let tcp = TcpStream::connect((host, port)).await?;
    let tls = connector.connect(server_name, tcp).await?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream TLS connection closed with error");
        }
    });

    Ok(sender.send_request(req).await?)
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
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request(false);
        stats.record_request(true);
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_tls_requests(), 1);
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.stats().get_total_requests(), 0);
        assert_eq!(pool.stats().get_tls_requests(), 0);
    }
}
