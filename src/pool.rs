//! Connection pool for local and neighbor forwarding
//!
//! One pooled hyper client serves both local backends (`http://127.0.0.1:<port>`)
//! and neighbor nodes (their private URL), so keep-alive connections are reused
//! across requests to the same target.

use crate::error::{BoxError, ProxyBody, ProxyResponse};
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("invalid upstream uri {uri}: {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
    #[error("request build error: {0}")]
    RequestBuild(#[from] hyper::http::Error),
}

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

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
    client: Client<HttpConnector, ProxyBody>,
    stats: Arc<PoolStats>,
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

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `base_url`, keeping its path and query
    ///
    /// The request's `Host` header is preserved so the upstream sees the
    /// tenant host the client asked for.
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
        base_url: &str,
    ) -> Result<ProxyResponse, PoolError> {
        let uri = upstream_uri(base_url, &req)?;

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.uri = uri;
        parts.version = hyper::Version::HTTP_11;

        self.stats.record_request();

        let response = match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let body = body.map_err(BoxError::from).boxed_unsync();

        Ok(Response::from_parts(parts, body))
    }
}

fn upstream_uri<B>(base_url: &str, req: &Request<B>) -> Result<Uri, PoolError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("{}{}", base_url.trim_end_matches('/'), path);
    uri.parse::<Uri>()
        .map_err(|source| PoolError::InvalidUri { uri, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use hyper::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-tenant", HeaderValue::from_static("acme"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-tenant").unwrap(), "acme");
    }

    #[test]
    fn test_upstream_uri_keeps_path_and_query() {
        let req = Request::builder()
            .uri("/api/collections?page=2")
            .body(())
            .unwrap();
        let uri = upstream_uri("http://10.0.0.7:8080/", &req).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.7:8080/api/collections?page=2");
    }

    #[test]
    fn test_upstream_uri_rejects_garbage() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(matches!(
            upstream_uri("http://bad host", &req),
            Err(PoolError::InvalidUri { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_request_preserves_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
            request
        });

        let pool = ConnectionPool::new(PoolConfig::default());
        let req = Request::builder()
            .uri("/hello?x=1")
            .header("host", "acme.tenant.example")
            .body(full_body("payload"))
            .unwrap();

        let response = pool
            .send_request(req, &format!("http://{}", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), hyper::StatusCode::CREATED);
        assert!(response.headers().get("connection").is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        let seen = server.await.unwrap().to_lowercase();
        assert!(seen.starts_with("get /hello?x=1 http/1.1"));
        assert!(seen.contains("host: acme.tenant.example"));
        assert_eq!(pool.stats().get_total_requests(), 1);
    }

    #[tokio::test]
    async fn test_send_request_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = ConnectionPool::new(PoolConfig::default());
        let req = Request::builder().uri("/").body(full_body("")).unwrap();
        let result = pool.send_request(req, &format!("http://{}", addr)).await;

        assert!(matches!(result, Err(PoolError::Client(_))));
        assert_eq!(pool.stats().get_failed_requests(), 1);
    }
}
