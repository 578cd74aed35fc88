use crate::dispatch::Dispatcher;
use crate::error::{full_body, json_error_response, ProxyErrorCode, ProxyResponse};
use crate::machine::MachineInfo;
use crate::recovery::{client_body, fault_response, fault_summary, is_abort, signature, HandlerAborted};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Liveness endpoint answered by the router itself, for any host
pub const HEALTH_PATH: &str = "/x/health";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Node identity and timing headers stamped on every response.
/// Start and end times are Unix epoch milliseconds.
pub struct EdgeHeaders {
    machine_id: (HeaderName, HeaderValue),
    region: (HeaderName, HeaderValue),
    start_time: HeaderName,
    end_time: HeaderName,
    duration: HeaderName,
}

impl EdgeHeaders {
    pub fn new(prefix: &str, machine: &MachineInfo) -> anyhow::Result<Self> {
        let name = |suffix: &str| HeaderName::from_bytes(format!("{}-{}", prefix, suffix).as_bytes());

        Ok(Self {
            machine_id: (name("Machine-Id")?, HeaderValue::from_str(&machine.machine_id)?),
            region: (name("Region")?, HeaderValue::from_str(&machine.region)?),
            start_time: name("Request-Start-Time")?,
            end_time: name("Request-End-Time")?,
            duration: name("Request-Duration")?,
        })
    }

    fn apply(&self, headers: &mut HeaderMap, started: DateTime<Utc>, elapsed: Duration) {
        let ended = Utc::now();
        headers.insert(self.machine_id.0.clone(), self.machine_id.1.clone());
        headers.insert(self.region.0.clone(), self.region.1.clone());
        for (name, value) in [
            (&self.start_time, started.timestamp_millis().to_string()),
            (&self.end_time, ended.timestamp_millis().to_string()),
            (&self.duration, elapsed.as_millis().to_string()),
        ] {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name.clone(), value);
            }
        }
    }
}

struct Context {
    dispatcher: Arc<Dispatcher>,
    edge: EdgeHeaders,
}

/// The front door: accepts connections and hands every request to the dispatcher
pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<Context>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        edge: EdgeHeaders,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(Context { dispatcher, edge }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, context: Arc<Context>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<Context>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, HandlerAborted> {
    let started = Utc::now();
    let clock = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let accept = req
        .headers()
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let mut response = recover(route_request(req, &context, client_addr), &path, accept.as_deref()).await?;

    let elapsed = clock.elapsed();
    context.edge.apply(response.headers_mut(), started, elapsed);

    debug!(
        method = %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Request served"
    );

    Ok(response)
}

/// Turn a panic inside `handler` into a 500 carrying its signature
async fn recover<F>(handler: F, path: &str, accept: Option<&str>) -> Result<ProxyResponse, HandlerAborted>
where
    F: Future<Output = Result<ProxyResponse, HandlerAborted>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(HandlerAborted)) => {
            debug!(path, "Client aborted request");
            Err(HandlerAborted)
        }
        Err(payload) if is_abort(payload.as_ref()) => {
            debug!(path, "Client aborted request");
            Err(HandlerAborted)
        }
        Err(payload) => {
            let signature = signature(path, &fault_summary(payload.as_ref()));
            error!(signature = %signature, "Request handler panicked");
            Ok(fault_response(accept, &signature))
        }
    }
}

async fn route_request(
    mut req: Request<Incoming>,
    context: &Context,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, HandlerAborted> {
    if req.uri().path() == HEALTH_PATH {
        return Ok(health_response());
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // X-Forwarded-* are overwritten, never appended: this proxy is the first trusted hop.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    // HTTP/2 clients may send only `:authority`; upstreams route on Host
    if !headers.contains_key(hyper::header::HOST) {
        if let Ok(value) = HeaderValue::from_str(&hostname) {
            headers.insert(hyper::header::HOST, value);
        }
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    context
        .dispatcher
        .handle(req.map(client_body), &hostname)
        .await
}

fn health_response() -> ProxyResponse {
    let mut response = Response::new(full_body(r#"{"message":"ok"}"#));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Hostname from the Host header, or from the URI authority (HTTP/2 `:authority`)
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
        .and_then(|h| {
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Alphanumeric, hyphen and dot only
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}
