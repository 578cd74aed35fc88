use crate::ports::PortStrategy;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity of this node
    #[serde(default)]
    pub machine: MachineConfig,

    /// Remote tenant registry
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Upstream for tenants not yet migrated to a machine
    #[serde(default)]
    pub legacy: LegacyConfig,

    /// Local tenant backends
    #[serde(default)]
    pub containers: ContainersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Verbose logging and dev-mode backends
    #[serde(default)]
    pub dev_mode: bool,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upper bound on a proxied request before 504 (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Platform apex, e.g. `tenant.example`. Tenant subdomains are the label before it.
    pub apex_domain: Option<String>,

    /// Prefix for platform response headers (default: X-Tenantgate)
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            dev_mode: false,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            apex_domain: None,
            header_prefix: default_header_prefix(),
        }
    }
}

impl ServerConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineProvider {
    /// Identity from this section (default)
    #[default]
    Local,
    /// Identity from the FLY_* environment
    Fly,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MachineConfig {
    #[serde(default)]
    pub provider: MachineProvider,

    #[serde(default = "default_machine_id")]
    pub machine_id: String,

    #[serde(default = "default_region")]
    pub region: String,

    pub private_ip: Option<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            provider: MachineProvider::Local,
            machine_id: default_machine_id(),
            region: default_region(),
            private_ip: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Base URL of the registry
    #[serde(default)]
    pub url: String,

    /// Admin identity
    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub password: String,

    /// Log every feed event
    #[serde(default)]
    pub debug: bool,

    /// First reconnect/re-auth delay ceiling in milliseconds (default: 250)
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Largest reconnect/re-auth delay ceiling in milliseconds (default: 30000)
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Records per backfill page (default: 500)
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            email: String::new(),
            password: String::new(),
            debug: false,
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LegacyConfig {
    /// Direct origin of the legacy fleet. Legacy routing is off when unset.
    pub origin_url: Option<String>,

    /// Helper proxy used by every node except the helper itself
    pub helper_proxy_url: Option<String>,

    /// Apex the legacy fleet serves tenants under
    #[serde(default)]
    pub apex_domain: String,

    /// Node that talks to the legacy origin directly
    #[serde(default)]
    pub helper_machine_id: String,

    /// Shared secret sent with every legacy request
    #[serde(default)]
    pub secret: String,

    /// Skip certificate verification for the legacy upstream (default: true)
    #[serde(default = "default_true")]
    pub insecure_tls: bool,

    /// Idle connections kept per legacy host (default: 1000)
    #[serde(default = "default_legacy_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 300)
    #[serde(default = "default_legacy_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            origin_url: None,
            helper_proxy_url: None,
            apex_domain: String::new(),
            helper_machine_id: String::new(),
            secret: String::new(),
            insecure_tls: true,
            max_idle_per_host: default_legacy_max_idle_per_host(),
            idle_timeout_secs: default_legacy_idle_timeout(),
        }
    }
}

impl LegacyConfig {
    pub fn enabled(&self) -> bool {
        self.origin_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainersConfig {
    /// Root of the per-tenant workspaces, wiped at boot (default: ./data)
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Backend executable (default: pocketbase)
    #[serde(default = "default_command")]
    pub command: String,

    /// Backend arguments. `{port}`, `{data_dir}`, `{migrations_dir}`,
    /// `{hooks_dir}`, `{public_dir}` and `{instance_id}` are substituted.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// First port handed to backends (default: 10000)
    #[serde(default = "default_port_start")]
    pub port_start: u16,

    /// End of the port range, exclusive (default: 12000)
    #[serde(default = "default_port_end")]
    pub port_end: u16,

    #[serde(default)]
    pub port_strategy: PortStrategy,

    /// Time allowed for a backend to turn healthy (default: 30)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Health poll interval during startup (default: 50)
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Idle TTL for instances without their own, 0 disables (default: 0)
    #[serde(default)]
    pub default_idle_ttl_secs: u64,

    /// Time to wait for in-flight requests before stopping a backend (default: 30)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL (default: 10)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            command: default_command(),
            args: default_args(),
            env: HashMap::new(),
            port_start: default_port_start(),
            port_end: default_port_end(),
            port_strategy: PortStrategy::default(),
            startup_timeout_secs: default_startup_timeout(),
            health_path: default_health_path(),
            health_check_interval_ms: default_health_interval(),
            default_idle_ttl_secs: 0,
            drain_timeout_secs: default_drain_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl ContainersConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn default_idle_ttl(&self) -> Option<Duration> {
        match self.default_idle_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_header_prefix() -> String {
    "X-Tenantgate".to_string()
}

fn default_machine_id() -> String {
    "loc1".to_string()
}

fn default_region() -> String {
    "local".to_string()
}

fn default_backoff_initial() -> u64 {
    250
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_page_size() -> u32 {
    500
}

fn default_true() -> bool {
    true
}

fn default_legacy_max_idle_per_host() -> usize {
    1000
}

fn default_legacy_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_command() -> String {
    "pocketbase".to_string()
}

fn default_args() -> Vec<String> {
    [
        "serve",
        "--http=127.0.0.1:{port}",
        "--dir={data_dir}",
        "--migrationsDir={migrations_dir}",
        "--hooksDir={hooks_dir}",
        "--publicDir={public_dir}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_port_start() -> u16 {
    10000
}

fn default_port_end() -> u16 {
    12000
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_health_interval() -> u64 {
    50
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    /// Read a TOML file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Override secrets from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(url) = get("REGISTRY_URL") {
            self.registry.url = url;
        }
        if let Some(email) = get("REGISTRY_EMAIL") {
            self.registry.email = email;
        }
        if let Some(password) = get("REGISTRY_PASSWORD") {
            self.registry.password = password;
        }
        if let Some(secret) = get("LEGACY_SECRET") {
            self.legacy.secret = secret;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.bind.parse::<SocketAddr>().is_err() {
            errors.push(format!("server.bind '{}' is not a socket address", self.server.bind));
        }
        if self.server.header_prefix.trim().is_empty() {
            errors.push("server.header_prefix must not be empty".to_string());
        }

        if self.machine.provider == MachineProvider::Local && self.machine.machine_id.is_empty() {
            errors.push("machine.machine_id is required for the local provider".to_string());
        }

        for (field, value) in [
            ("registry.url", &self.registry.url),
            ("registry.email", &self.registry.email),
            ("registry.password", &self.registry.password),
        ] {
            if value.is_empty() {
                errors.push(format!("{} is required", field));
            }
        }
        if self.registry.backoff_initial_ms == 0 || self.registry.backoff_initial_ms > self.registry.backoff_max_ms {
            errors.push("registry.backoff_initial_ms must be in 1..=backoff_max_ms".to_string());
        }
        if self.registry.page_size == 0 {
            errors.push("registry.page_size must be greater than 0".to_string());
        }

        if self.legacy.enabled() {
            if self.legacy.apex_domain.is_empty() {
                errors.push("legacy.apex_domain is required when legacy.origin_url is set".to_string());
            }
            if self.legacy.secret.is_empty() {
                errors.push("legacy.secret is required when legacy.origin_url is set".to_string());
            }
        }

        if self.containers.command.is_empty() {
            errors.push("containers.command must not be empty".to_string());
        }
        if self.containers.port_start == 0 || self.containers.port_start >= self.containers.port_end {
            errors.push(format!(
                "containers port range {}-{} is empty",
                self.containers.port_start, self.containers.port_end
            ));
        }
        if self.containers.health_check_interval_ms == 0 {
            errors.push("containers.health_check_interval_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
