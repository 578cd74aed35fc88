//! Tenant backend process boundary
//!
//! The orchestrator treats a backend as opaque: hand it a [`BackendSpec`],
//! get back a [`RunningBackend`] that can be awaited for readiness, awaited
//! for exit, and stopped. [`ProcessLauncher`] implements this by spawning a
//! local command and polling its health endpoint.

use crate::config::ContainersConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Everything a backend needs to serve one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub instance_id: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub migrations_dir: PathBuf,
    pub hooks_dir: PathBuf,
    /// Served for paths the tenant has no catch-all route for
    pub public_dir: PathBuf,
    pub dev_mode: bool,
}

impl BackendSpec {
    /// Lay out the tenant's directories under `<root>/<instance_id>`
    pub fn new(root: &Path, instance_id: &str, port: u16, dev_mode: bool) -> Self {
        let base = root.join(instance_id);
        Self {
            instance_id: instance_id.to_string(),
            port,
            data_dir: base.join("data"),
            migrations_dir: base.join("migrations"),
            hooks_dir: base.join("hooks"),
            public_dir: base.join("public"),
            dev_mode,
        }
    }

    pub fn directories(&self) -> [&Path; 4] {
        [
            &self.data_dir,
            &self.migrations_dir,
            &self.hooks_dir,
            &self.public_dir,
        ]
    }

    /// Local base URL the backend serves on
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend exited before becoming ready ({0})")]
    ExitedEarly(String),

    #[error("backend not healthy after {0:?}")]
    Timeout(Duration),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, spec: &BackendSpec) -> Result<Box<dyn RunningBackend>, LaunchError>;
}

#[async_trait]
pub trait RunningBackend: Send {
    /// Resolve once the backend is serving, or with the reason it never will
    async fn wait_ready(&mut self) -> Result<(), LaunchError>;

    /// Resolve when the backend exits, with a description of how
    async fn wait_exit(&mut self) -> String;

    /// Ask the backend to exit, forcing it after `grace`
    async fn stop(&mut self, grace: Duration);
}

/// Runs the configured command as the tenant backend
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    health_path: String,
    health_interval: Duration,
    startup_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(config: &ContainersConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            health_path: config.health_path.clone(),
            health_interval: config.health_check_interval(),
            startup_timeout: config.startup_timeout(),
        }
    }

    fn render_args(&self, spec: &BackendSpec) -> Vec<String> {
        let mut args: Vec<String> = self.args.iter().map(|arg| render_arg(arg, spec)).collect();
        if spec.dev_mode {
            args.push("--dev".to_string());
        }
        args
    }
}

fn render_arg(template: &str, spec: &BackendSpec) -> String {
    template
        .replace("{port}", &spec.port.to_string())
        .replace("{data_dir}", &spec.data_dir.to_string_lossy())
        .replace("{migrations_dir}", &spec.migrations_dir.to_string_lossy())
        .replace("{hooks_dir}", &spec.hooks_dir.to_string_lossy())
        .replace("{public_dir}", &spec.public_dir.to_string_lossy())
        .replace("{instance_id}", &spec.instance_id)
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(&self, spec: &BackendSpec) -> Result<Box<dyn RunningBackend>, LaunchError> {
        let args = self.render_args(spec);
        info!(instance_id = %spec.instance_id, command = %self.command, port = spec.port, "Starting backend");

        let mut cmd = Command::new(&self.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", spec.port.to_string());

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: self.command.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(instance_id = %spec.instance_id, pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, spec.instance_id.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, spec.instance_id.clone(), "stderr");
        }

        Ok(Box::new(ProcessBackend {
            instance_id: spec.instance_id.clone(),
            health_addr: format!("127.0.0.1:{}", spec.port),
            health_path: self.health_path.clone(),
            health_interval: self.health_interval,
            startup_timeout: self.startup_timeout,
            child,
        }))
    }
}

/// Relay a child's output into the log, line by line
fn forward_output<R>(reader: R, instance_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if stream == "stderr" {
                warn!(target: "backend", instance_id = %instance_id, stream, "{}", line);
            } else {
                info!(target: "backend", instance_id = %instance_id, stream, "{}", line);
            }
        }
    });
}

struct ProcessBackend {
    instance_id: String,
    health_addr: String,
    health_path: String,
    health_interval: Duration,
    startup_timeout: Duration,
    child: Child,
}

#[async_trait]
impl RunningBackend for ProcessBackend {
    async fn wait_ready(&mut self) -> Result<(), LaunchError> {
        let start = Instant::now();
        debug!(instance_id = %self.instance_id, addr = %self.health_addr, path = %self.health_path, "Polling backend health");

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(LaunchError::ExitedEarly(status.to_string()));
            }

            if check_health(&self.health_addr, &self.health_path).await {
                info!(
                    instance_id = %self.instance_id,
                    startup_ms = start.elapsed().as_millis() as u64,
                    "Backend is ready"
                );
                return Ok(());
            }

            if start.elapsed() > self.startup_timeout {
                warn!(instance_id = %self.instance_id, "Backend startup timeout exceeded");
                let _ = self.child.kill().await;
                return Err(LaunchError::Timeout(self.startup_timeout));
            }

            tokio::time::sleep(self.health_interval).await;
        }
    }

    async fn wait_exit(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        }
    }

    async fn stop(&mut self, grace: Duration) {
        if let Some(pid) = self.child.id() {
            info!(instance_id = %self.instance_id, pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(instance_id = %self.instance_id, %status, "Backend exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(instance_id = %self.instance_id, error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    instance_id = %self.instance_id,
                    grace_period_secs = grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = self.child.kill().await;
            }
        }
    }
}

/// GET `path` on `addr` and report whether it answered 2xx
pub async fn check_health(addr: &str, path: &str) -> bool {
    let connect = tokio::time::timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(addr)).await;
    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        _ => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let status_line = tokio::time::timeout(Duration::from_secs(2), async {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok::<_, std::io::Error>(line)
    })
    .await;

    match status_line {
        // "HTTP/1.1 200 OK"
        Ok(Ok(line)) => line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}
