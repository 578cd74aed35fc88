//! Error responses produced at the edge
//!
//! Every error response carries an `X-Tenantgate-Error` header naming its
//! [`ProxyErrorCode`]. Denials are sent as plain text so tenants see the
//! reason verbatim; everything else is a small JSON document.

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type for everything the edge sends back
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub type ProxyResponse = Response<ProxyBody>;

/// Header naming the error code of an edge-generated response
pub const ERROR_HEADER: &str = "x-tenantgate-error";

/// Message for every 503, whatever the internal cause
pub const UNAVAILABLE_MESSAGE: &str = "Instance is temporarily unavailable, please retry shortly";

/// Error codes for edge errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Host resolves to no known instance
    DeploymentNotFound,
    /// A gate denied the request
    Forbidden,
    /// Backend could not be provided right now
    Unavailable,
    /// Upstream connection or protocol failure
    UpstreamFailed,
    /// Upstream took longer than the request timeout
    UpstreamTimeout,
    /// Uncaught fault
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::DeploymentNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::DeploymentNotFound => "DEPLOYMENT_NOT_FOUND",
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::Unavailable => "UNAVAILABLE",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Wrap bytes in the edge body type
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Keep `guard` alive until `body` has been sent or dropped
pub fn guarded_body<G>(body: ProxyBody, guard: G) -> ProxyBody
where
    G: Send + Unpin + 'static,
{
    GuardedBody { inner: body, _guard: guard }.boxed_unsync()
}

struct GuardedBody<G> {
    inner: ProxyBody,
    _guard: G,
}

impl<G: Unpin> Body for GuardedBody<G> {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn error_response(code: ProxyErrorCode, content_type: &'static str, body: String) -> ProxyResponse {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    headers.insert(ERROR_HEADER, hyper::header::HeaderValue::from_static(code.as_header_value()));
    response
}

/// JSON error response with the error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> ProxyResponse {
    error_response(
        code,
        "application/json",
        ErrorResponse::new(code, message).to_json(),
    )
}

/// Plain-text error response whose body is exactly `message`
pub fn text_error_response(code: ProxyErrorCode, message: impl Into<String>) -> ProxyResponse {
    error_response(code, "text/plain; charset=utf-8", message.into())
}

/// 503 with the generic retry message
pub fn unavailable_response() -> ProxyResponse {
    json_error_response(ProxyErrorCode::Unavailable, UNAVAILABLE_MESSAGE)
}
