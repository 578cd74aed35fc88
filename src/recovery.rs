//! Fault boundary for the front door
//!
//! Any panic escaping request handling becomes a 500 whose body carries a
//! signature (request path plus fault summary) that also appears in the log
//! line for the fault. The page is JSON, plain text or HTML depending on the
//! request's `Accept` header.
//!
//! [`HandlerAborted`] marks a request whose client went away. It is not a
//! fault: the connection is dropped without a response and the event is only
//! logged at debug level.

use crate::error::{full_body, BoxError, ProxyBody, ProxyErrorCode, ProxyResponse, ERROR_HEADER};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::Response;
use std::any::Any;
use std::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("handler aborted")]
pub struct HandlerAborted;

/// Inbound body whose read failures are reported as [`HandlerAborted`]
pub fn client_body(body: Incoming) -> ProxyBody {
    body.map_err(|_| -> BoxError { Box::new(HandlerAborted) })
        .boxed_unsync()
}

/// Whether `err` was caused by the client going away mid-request
pub fn caused_by_abort(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<HandlerAborted>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Whether a panic payload is a deliberate abort
pub fn is_abort(payload: &(dyn Any + Send)) -> bool {
    payload.is::<HandlerAborted>()
}

/// One-line description of a panic payload
pub fn fault_summary(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown fault".to_string()
    }
}

pub fn signature(path: &str, summary: &str) -> String {
    format!("{}: {}", path, summary)
}

/// Render the 500 for a fault, negotiated by `accept`
pub fn fault_response(accept: Option<&str>, signature: &str) -> ProxyResponse {
    let accept = accept.unwrap_or("").to_ascii_lowercase();

    let (content_type, body) = if accept.contains("application/json") {
        let body = serde_json::json!({
            "code": ProxyErrorCode::InternalError.as_header_value(),
            "message": "Internal Server Error",
            "signature": signature,
        });
        ("application/json", body.to_string())
    } else if accept.contains("text/plain") {
        ("text/plain; charset=utf-8", format!("Internal Server Error\n{}\n", signature))
    } else {
        (
            "text/html; charset=utf-8",
            format!(
                "<!DOCTYPE html>\n<html><head><title>Internal Server Error</title></head>\
                 <body><h1>Internal Server Error</h1><pre>{}</pre></body></html>\n",
                escape_html(signature)
            ),
        )
    };

    let mut response = Response::new(full_body(body));
    *response.status_mut() = ProxyErrorCode::InternalError.status_code();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response.headers_mut().insert(
        ERROR_HEADER,
        HeaderValue::from_static(ProxyErrorCode::InternalError.as_header_value()),
    );
    response
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    async fn body_string(response: ProxyResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[derive(Debug, thiserror::Error)]
    #[error("upstream write failed")]
    struct Wrapper(#[source] HandlerAborted);

    #[test]
    fn test_abort_detection_through_sources() {
        let wrapped = Wrapper(HandlerAborted);
        assert!(caused_by_abort(&wrapped));

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(!caused_by_abort(&io));
    }

    #[test]
    fn test_panic_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("index out of bounds")).unwrap_err();
        assert_eq!(fault_summary(payload.as_ref()), "index out of bounds");
        assert!(!is_abort(payload.as_ref()));

        let payload = std::panic::catch_unwind(|| panic!("{} of {}", 3, 4)).unwrap_err();
        assert_eq!(fault_summary(payload.as_ref()), "3 of 4");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(HandlerAborted)).unwrap_err();
        assert!(is_abort(payload.as_ref()));
        assert_eq!(fault_summary(payload.as_ref()), "unknown fault");
    }

    #[tokio::test]
    async fn test_fault_response_json() {
        let response = fault_response(Some("application/json"), "/api/x: boom");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["signature"], "/api/x: boom");
    }

    #[tokio::test]
    async fn test_fault_response_plain() {
        let response = fault_response(Some("text/plain"), "/a: b");
        assert_eq!(body_string(response).await, "Internal Server Error\n/a: b\n");
    }

    #[tokio::test]
    async fn test_fault_response_defaults_to_escaped_html() {
        let response = fault_response(None, "/<script>: x");
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html; charset=utf-8");
        let body = body_string(response).await;
        assert!(body.contains("/&lt;script&gt;: x"));
        assert!(!body.contains("<script>"));
    }
}
