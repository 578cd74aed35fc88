//! Deployment resolution
//!
//! A [`Deployment`] joins an instance with its owning user and, for migrated
//! tenants, its owning machine. It is built fresh for every request and only
//! exposes what routing needs.

use crate::mirror::Mirror;
use crate::models::{Instance, Machine, User};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no deployment for host {0}")]
    NotFound(String),

    /// The instance exists but a record it references does not
    #[error("instance {instance_id} references missing {kind} {id}")]
    Integrity {
        instance_id: String,
        kind: &'static str,
        id: String,
    },
}

#[derive(Debug, Clone)]
pub struct Deployment {
    instance: Arc<Instance>,
    user: Arc<User>,
    machine: Option<Arc<Machine>>,
}

impl Deployment {
    pub fn new(instance: Arc<Instance>, user: Arc<User>, machine: Option<Arc<Machine>>) -> Self {
        Self {
            instance,
            user,
            machine,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }

    /// Owning machine id, empty for legacy tenants
    pub fn machine_id(&self) -> &str {
        &self.instance.machine_id
    }

    pub fn is_legacy(&self) -> bool {
        self.instance.is_legacy()
    }

    pub fn is_user_verified(&self) -> bool {
        self.user.verified
    }

    pub fn is_user_suspended(&self) -> bool {
        self.user.is_suspended()
    }

    pub fn user_suspended_reason(&self) -> &str {
        &self.user.suspension
    }

    pub fn is_instance_suspended(&self) -> bool {
        self.instance.is_suspended()
    }

    pub fn instance_suspended_reason(&self) -> &str {
        &self.instance.suspension
    }

    pub fn is_instance_powered_on(&self) -> bool {
        self.instance.power
    }

    pub fn subdomain(&self) -> &str {
        &self.instance.subdomain
    }

    pub fn is_dev(&self) -> bool {
        self.instance.dev
    }

    /// Private base URL of the owning machine
    pub fn private_url(&self) -> Option<&str> {
        self.machine
            .as_ref()
            .map(|m| m.private_url.as_str())
            .filter(|url| !url.is_empty())
    }

    /// Instance-specific idle timeout, if one is set
    pub fn idle_ttl(&self) -> Option<Duration> {
        match self.instance.idle_ttl {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

pub struct DeploymentResolver {
    mirror: Arc<Mirror>,
}

impl DeploymentResolver {
    pub fn new(mirror: Arc<Mirror>) -> Self {
        Self { mirror }
    }

    pub fn resolve(&self, host: &str) -> Result<Deployment, ResolveError> {
        let instance = self
            .mirror
            .instance_by_host_header(host)
            .ok_or_else(|| ResolveError::NotFound(host.to_string()))?;

        let user = self.mirror.user_by_id(&instance.uid).ok_or_else(|| {
            integrity_violation(&instance, "user", &instance.uid)
        })?;

        let machine = if instance.is_legacy() {
            None
        } else {
            let machine = self.mirror.machine_by_id(&instance.machine_id).ok_or_else(|| {
                integrity_violation(&instance, "machine", &instance.machine_id)
            })?;
            Some(machine)
        };

        Ok(Deployment::new(instance, user, machine))
    }
}

fn integrity_violation(instance: &Instance, kind: &'static str, id: &str) -> ResolveError {
    error!(instance_id = %instance.id, kind, id, "Instance references a missing record");
    ResolveError::Integrity {
        instance_id: instance.id.clone(),
        kind,
        id: id.to_string(),
    }
}
