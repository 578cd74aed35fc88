//! Forwarding to the legacy fleet
//!
//! Legacy tenants are served by a separate fleet that routes on
//! `<subdomain>.<apex>`. Requests are rewritten onto that host, signed with a
//! shared-secret header and sent either straight to the legacy origin (on the
//! helper node, or when no helper is configured) or through the helper proxy.

use crate::config::LegacyConfig;
use crate::deployment::Deployment;
use crate::error::{BoxError, ProxyBody, ProxyResponse};
use crate::pool::strip_hop_by_hop;
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body as _, Bytes, Frame};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Request, Response};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LegacyError {
    #[error("legacy request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid legacy header: {0}")]
    Header(String),
}

pub struct LegacyUpstream {
    client: reqwest::Client,
    target: String,
    apex_domain: String,
    secret_header: HeaderName,
    secret: HeaderValue,
}

impl LegacyUpstream {
    /// Build the upstream, or `None` when legacy routing is not configured
    pub fn new(
        config: &LegacyConfig,
        this_machine_id: &str,
        header_prefix: &str,
    ) -> anyhow::Result<Option<Self>> {
        let Some(origin) = config.origin_url.as_deref().filter(|url| !url.is_empty()) else {
            return Ok(None);
        };

        let helper = config
            .helper_proxy_url
            .as_deref()
            .filter(|url| !url.is_empty());
        let target = match helper {
            Some(helper) if this_machine_id != config.helper_machine_id => helper,
            _ => origin,
        };

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_tls)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout())
            .build()?;

        let secret_header = HeaderName::from_bytes(format!("{}-Secret", header_prefix).as_bytes())?;
        let secret = HeaderValue::from_str(&config.secret)?;

        info!(
            upstream = %target,
            apex = %config.apex_domain,
            direct = target == origin,
            "Legacy upstream configured"
        );

        Ok(Some(Self {
            client,
            target: target.trim_end_matches('/').to_string(),
            apex_domain: config.apex_domain.clone(),
            secret_header,
            secret,
        }))
    }

    /// Base URL legacy requests are sent to
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Host the legacy fleet knows this tenant by
    pub fn rewrite_host(&self, subdomain: &str, request_host: &str) -> String {
        let label = if subdomain.is_empty() {
            request_host.split('.').next().unwrap_or(request_host)
        } else {
            subdomain
        };
        format!("{}.{}", label, self.apex_domain)
    }

    pub async fn forward(
        &self,
        req: Request<ProxyBody>,
        deployment: &Deployment,
        request_host: &str,
    ) -> Result<ProxyResponse, LegacyError> {
        let host = self.rewrite_host(deployment.subdomain(), request_host);
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.target, path);

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(
            HOST,
            HeaderValue::from_str(&host).map_err(|_| LegacyError::Header(host.clone()))?,
        );
        parts
            .headers
            .insert(self.secret_header.clone(), self.secret.clone());

        debug!(
            instance_id = %deployment.instance_id(),
            host = %host,
            url = %url,
            "Forwarding to legacy fleet"
        );

        let body = if body.is_end_stream() {
            reqwest::Body::from(Bytes::new())
        } else {
            reqwest::Body::wrap_stream(body.into_data_stream())
        };

        let response = self
            .client
            .request(parts.method, &url)
            .headers(parts.headers)
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(response.status());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in response.headers() {
                headers.append(name.clone(), value.clone());
            }
            strip_hop_by_hop(headers);
        }

        let body = StreamBody::new(
            response
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(BoxError::from),
        )
        .boxed_unsync();

        builder
            .body(body)
            .map_err(|e| LegacyError::Header(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use crate::models::{Instance, User};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(origin: &str) -> LegacyConfig {
        LegacyConfig {
            origin_url: Some(origin.to_string()),
            helper_proxy_url: Some("http://helper.internal:8080".to_string()),
            apex_domain: "legacy.example".to_string(),
            helper_machine_id: "helper1".to_string(),
            secret: "s3cret".to_string(),
            ..Default::default()
        }
    }

    fn deployment(subdomain: &str) -> Deployment {
        let instance = Instance {
            id: "i1".to_string(),
            uid: "u1".to_string(),
            subdomain: subdomain.to_string(),
            ..Default::default()
        };
        let user = User {
            id: "u1".to_string(),
            verified: true,
            ..Default::default()
        };
        Deployment::new(Arc::new(instance), Arc::new(user), None)
    }

    #[test]
    fn test_disabled_without_origin() {
        let upstream = LegacyUpstream::new(&LegacyConfig::default(), "m1", "X-Tenantgate").unwrap();
        assert!(upstream.is_none());
    }

    #[test]
    fn test_target_selection() {
        let config = config("https://origin.legacy.example");

        let helper = LegacyUpstream::new(&config, "helper1", "X-Tenantgate").unwrap().unwrap();
        assert_eq!(helper.target(), "https://origin.legacy.example");

        let other = LegacyUpstream::new(&config, "m2", "X-Tenantgate").unwrap().unwrap();
        assert_eq!(other.target(), "http://helper.internal:8080");

        let mut no_helper = config.clone();
        no_helper.helper_proxy_url = None;
        let direct = LegacyUpstream::new(&no_helper, "m2", "X-Tenantgate").unwrap().unwrap();
        assert_eq!(direct.target(), "https://origin.legacy.example");
    }

    #[test]
    fn test_rewrite_host() {
        let upstream = LegacyUpstream::new(&config("http://o"), "helper1", "X-Tenantgate")
            .unwrap()
            .unwrap();
        assert_eq!(upstream.rewrite_host("acme", "www.acme.io"), "acme.legacy.example");
        assert_eq!(upstream.rewrite_host("", "beta.tenant.example"), "beta.legacy.example");
    }

    #[tokio::test]
    async fn test_forward_rewrites_and_signs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 418 I'm a teapot\r\nContent-Length: 6\r\nX-Legacy: yes\r\nConnection: close\r\n\r\nteapot")
                .await
                .unwrap();
            request
        });

        let upstream = LegacyUpstream::new(&config(&format!("http://{}", addr)), "helper1", "X-Tenantgate")
            .unwrap()
            .unwrap();
        let req = Request::builder()
            .uri("/brew?cups=2")
            .header("host", "acme.tenant.example")
            .body(full_body(""))
            .unwrap();

        let response = upstream
            .forward(req, &deployment("acme"), "acme.tenant.example")
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 418);
        assert_eq!(response.headers().get("x-legacy").unwrap(), "yes");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"teapot");

        let seen = server.await.unwrap().to_lowercase();
        assert!(seen.starts_with("get /brew?cups=2 http/1.1"));
        assert!(seen.contains("host: acme.legacy.example"));
        assert!(seen.contains("x-tenantgate-secret: s3cret"));
    }
}
