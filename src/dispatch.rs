//! Per-request routing
//!
//! A request is resolved to a [`Deployment`], checked against the access
//! gates, then classified by where its backend lives:
//!
//! - **legacy**: the instance has no owning machine and is forwarded to the
//!   legacy fleet
//! - **local**: the owning machine is this node and the backend is started on
//!   demand by the [`ContainerService`]
//! - **neighbor**: the owning machine is another node and the request goes to
//!   that node's private URL, stamped with `<prefix>-Forwarded-By`. A request
//!   that already carries the stamp is never forwarded again.

use crate::container::ContainerService;
use crate::deployment::{Deployment, DeploymentResolver, ResolveError};
use crate::error::{
    guarded_body, json_error_response, text_error_response, unavailable_response, ProxyBody,
    ProxyErrorCode, ProxyResponse,
};
use crate::legacy::LegacyUpstream;
use crate::pool::ConnectionPool;
use crate::recovery::{caused_by_abort, HandlerAborted};
use hyper::header::{HeaderName, HeaderValue};
use hyper::Request;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tracing::{debug, error, warn};

/// Why a resolved deployment may not be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    Unverified,
    UserSuspended(String),
    InstanceSuspended(String),
    PoweredOff,
}

impl Denial {
    /// Message returned to the client as the 403 body
    pub fn reason(&self) -> &str {
        match self {
            Denial::Unverified => "Please verify your account.",
            Denial::UserSuspended(reason) | Denial::InstanceSuspended(reason) => reason,
            Denial::PoweredOff => "Instance is not powered on",
        }
    }
}

/// Evaluate the gates in order; the first one that fails decides.
pub fn check_gates(deployment: &Deployment) -> Result<(), Denial> {
    if !deployment.is_user_verified() {
        return Err(Denial::Unverified);
    }
    if deployment.is_user_suspended() {
        return Err(Denial::UserSuspended(deployment.user_suspended_reason().to_string()));
    }
    if deployment.is_instance_suspended() {
        return Err(Denial::InstanceSuspended(
            deployment.instance_suspended_reason().to_string(),
        ));
    }
    if !deployment.is_instance_powered_on() {
        return Err(Denial::PoweredOff);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Legacy,
    Local,
    Neighbor,
}

impl Placement {
    pub fn classify(machine_id: &str, this_machine_id: &str) -> Self {
        if machine_id.is_empty() {
            Placement::Legacy
        } else if machine_id == this_machine_id {
            Placement::Local
        } else {
            Placement::Neighbor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Placement::Legacy => "legacy",
            Placement::Local => "local",
            Placement::Neighbor => "neighbor",
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum Route {
    Denied(Denial),
    Forward {
        placement: Placement,
        deployment: Deployment,
    },
}

/// Default name of the neighbor hop header
pub const FORWARDED_BY_HEADER: &str = "x-tenantgate-forwarded-by";

pub struct Dispatcher {
    resolver: DeploymentResolver,
    containers: Arc<ContainerService>,
    pool: Arc<ConnectionPool>,
    legacy: Option<LegacyUpstream>,
    machine_id: String,
    request_timeout: Duration,
    forwarded_by: HeaderName,
}

impl Dispatcher {
    pub fn new(
        resolver: DeploymentResolver,
        containers: Arc<ContainerService>,
        pool: Arc<ConnectionPool>,
        legacy: Option<LegacyUpstream>,
        machine_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            containers,
            pool,
            legacy,
            machine_id: machine_id.into(),
            request_timeout,
            forwarded_by: HeaderName::from_static(FORWARDED_BY_HEADER),
        }
    }

    /// Name the hop header `<prefix>-Forwarded-By`
    pub fn with_header_prefix(mut self, prefix: &str) -> anyhow::Result<Self> {
        self.forwarded_by = HeaderName::from_bytes(format!("{}-Forwarded-By", prefix).as_bytes())?;
        Ok(self)
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn containers(&self) -> &Arc<ContainerService> {
        &self.containers
    }

    /// Decide what happens to a request for `host`
    pub fn route(&self, host: &str) -> Result<Route, ResolveError> {
        let deployment = self.resolver.resolve(host)?;

        if let Err(denial) = check_gates(&deployment) {
            return Ok(Route::Denied(denial));
        }

        let placement = Placement::classify(deployment.machine_id(), &self.machine_id);
        Ok(Route::Forward {
            placement,
            deployment,
        })
    }

    /// Serve one request. `Err` means the client went away and the connection
    /// should be dropped without a response.
    pub async fn handle(
        &self,
        req: Request<ProxyBody>,
        host: &str,
    ) -> Result<ProxyResponse, HandlerAborted> {
        let route = match self.route(host) {
            Ok(route) => route,
            Err(ResolveError::NotFound(_)) => {
                debug!(host, "No deployment for host");
                return Ok(json_error_response(
                    ProxyErrorCode::DeploymentNotFound,
                    "Deployment not found",
                ));
            }
            Err(ResolveError::Integrity { .. }) => return Ok(unavailable_response()),
        };

        match route {
            Route::Denied(denial) => {
                debug!(host, reason = denial.reason(), "Request denied");
                Ok(text_error_response(ProxyErrorCode::Forbidden, denial.reason()))
            }
            Route::Forward {
                placement,
                deployment,
            } => self.forward(req, host, placement, &deployment).await,
        }
    }

    async fn forward(
        &self,
        req: Request<ProxyBody>,
        host: &str,
        placement: Placement,
        deployment: &Deployment,
    ) -> Result<ProxyResponse, HandlerAborted> {
        let instance_id = deployment.instance_id();
        debug!(host, instance_id, %placement, "Dispatching request");

        match placement {
            Placement::Legacy => {
                let Some(legacy) = &self.legacy else {
                    warn!(host, instance_id, "Legacy routing is not configured");
                    return Ok(unavailable_response());
                };
                let result =
                    tokio::time::timeout(self.request_timeout, legacy.forward(req, deployment, host))
                        .await;
                self.finish(result, instance_id, placement)
            }
            Placement::Local => {
                let in_flight = match self.containers.acquire(deployment).await {
                    Ok(in_flight) => in_flight,
                    Err(e) => {
                        error!(host, instance_id, error = %e, "Backend unavailable");
                        return Ok(unavailable_response());
                    }
                };
                let base_url = in_flight.container().base_url().to_string();
                let result =
                    tokio::time::timeout(self.request_timeout, self.pool.send_request(req, &base_url))
                        .await;
                // The container stays busy until the response body is done
                let result = result.map(|sent| {
                    sent.map(|response| response.map(|body| guarded_body(body, in_flight)))
                });
                self.finish(result, instance_id, placement)
            }
            Placement::Neighbor => {
                if let Some(from) = req.headers().get(&self.forwarded_by) {
                    error!(
                        host,
                        instance_id,
                        from = from.to_str().unwrap_or("<invalid>"),
                        owner = deployment.machine_id(),
                        "Neighbor forwarded a request this node routes elsewhere, refusing to bounce it"
                    );
                    return Ok(unavailable_response());
                }
                let Some(url) = deployment.private_url() else {
                    error!(
                        host,
                        instance_id,
                        machine_id = deployment.machine_id(),
                        "Owning machine has no private URL"
                    );
                    return Ok(unavailable_response());
                };
                let mut req = req;
                if let Ok(value) = HeaderValue::from_str(&self.machine_id) {
                    req.headers_mut().insert(self.forwarded_by.clone(), value);
                }
                let result =
                    tokio::time::timeout(self.request_timeout, self.pool.send_request(req, url))
                        .await;
                self.finish(result, instance_id, placement)
            }
        }
    }

    fn finish<E>(
        &self,
        result: Result<Result<ProxyResponse, E>, Elapsed>,
        instance_id: &str,
        placement: Placement,
    ) -> Result<ProxyResponse, HandlerAborted>
    where
        E: std::error::Error + 'static,
    {
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if caused_by_abort(&e) => {
                debug!(instance_id, %placement, "Client went away mid-request");
                Err(HandlerAborted)
            }
            Ok(Err(e)) => {
                error!(instance_id, %placement, error = %e, "Failed to forward request");
                Ok(json_error_response(
                    ProxyErrorCode::UpstreamFailed,
                    "Failed to reach upstream",
                ))
            }
            Err(_) => {
                warn!(
                    instance_id,
                    %placement,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                Ok(json_error_response(
                    ProxyErrorCode::UpstreamTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                ))
            }
        }
    }
}
