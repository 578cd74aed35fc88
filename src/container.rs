//! Lazy, single-flight backend orchestration
//!
//! Each deployment key moves through `absent -> initializing -> ready`, or
//! `absent -> initializing -> failed`, in which case the key is evicted so the
//! next request starts over. The first caller for an absent key inserts a
//! placeholder and spawns the initialization as its own task; every caller,
//! the first included, then waits on the placeholder's phase channel. A caller
//! that goes away mid-startup therefore never cancels the startup for the
//! others.
//!
//! Once ready, a supervisor task owns the backend. It evicts the key when the
//! backend exits on its own, or stops the backend when asked (idle reaping,
//! shutdown) and then evicts. A stopping key is `ready -> stopping -> stopped`:
//! it stops admitting requests, drains the ones in flight, and callers that
//! arrive meanwhile wait for the eviction and start a fresh backend.
//!
//! Ports are never returned to the allocator.

use crate::backend::{BackendLauncher, BackendSpec, LaunchError, RunningBackend};
use crate::config::ContainersConfig;
use crate::deployment::Deployment;
use crate::ports::{PortAllocator, PortError};
use crate::slot_map::SlotMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

const STOP_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Ports(#[from] PortError),

    #[error("failed to prepare workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start backend: {0}")]
    Launch(#[from] LaunchError),

    #[error("backend initialization aborted")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Initializing,
    Ready,
    Stopping,
    Failed,
}

/// A running local backend
#[derive(Debug)]
pub struct Container {
    instance_id: String,
    port: u16,
    base_url: String,
    idle_ttl: Option<Duration>,
    started_at: Instant,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    stopping: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Container {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// e.g. `http://127.0.0.1:10000`
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Requests currently holding an [`InFlight`] guard
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Admit a request. Returns `None` once the container has started stopping.
    pub fn enter(self: &Arc<Self>) -> Option<InFlight> {
        // Count first, then check: the supervisor sets `stopping` before it
        // reads the count, so one of the two always sees the other.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.is_stopping() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        self.touch();
        Some(InFlight {
            container: Arc::clone(self),
        })
    }

    /// Ask the supervisor to stop this backend. Returns false if already asked.
    pub fn request_stop(&self) -> bool {
        match self.stop_tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// A request admitted to a container. The container is neither reaped nor
/// stopped while this is alive.
#[derive(Debug)]
pub struct InFlight {
    container: Arc<Container>,
}

impl InFlight {
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.container.touch();
        self.container.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
enum Phase {
    Initializing,
    Ready(Arc<Container>),
    Stopping,
    /// Evicted; the key is free again
    Stopped,
    Failed(Arc<ContainerError>),
}

struct Slot {
    phase: watch::Receiver<Phase>,
}

pub struct ContainerService {
    table: SlotMap<String, Arc<Slot>>,
    ports: PortAllocator,
    launcher: Arc<dyn BackendLauncher>,
    data_root: PathBuf,
    dev_mode: bool,
    default_idle_ttl: Option<Duration>,
    drain_timeout: Duration,
    grace_period: Duration,
    started: AtomicBool,
}

impl ContainerService {
    pub fn new(config: &ContainersConfig, dev_mode: bool, launcher: Arc<dyn BackendLauncher>) -> Self {
        Self {
            table: SlotMap::new(),
            ports: PortAllocator::new(config.port_start, config.port_end, config.port_strategy),
            launcher,
            data_root: config.data_root.clone(),
            dev_mode,
            default_idle_ttl: config.default_idle_ttl(),
            drain_timeout: config.drain_timeout(),
            grace_period: config.shutdown_grace_period(),
            started: AtomicBool::new(false),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Wipe every tenant workspace under the data root. Runs once per service.
    pub fn start(&self) -> std::io::Result<usize> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        std::fs::create_dir_all(&self.data_root)?;
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.data_root)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
                removed += 1;
            }
        }

        let (start, end) = self.ports.range();
        info!(
            data_root = %self.data_root.display(),
            removed,
            port_start = start,
            port_end = end,
            "Container service started"
        );
        Ok(removed)
    }

    /// Return the running backend for a deployment, starting it if needed.
    ///
    /// Concurrent callers for the same deployment share one startup and all
    /// observe its outcome.
    pub async fn get_or_create(self: &Arc<Self>, deployment: &Deployment) -> Result<Arc<Container>, Arc<ContainerError>> {
        let key = deployment.instance_id();

        loop {
            let (phase_tx, phase_rx) = watch::channel(Phase::Initializing);
            let (slot, loaded) = self
                .table
                .load_or_store(key.to_string(), Arc::new(Slot { phase: phase_rx }));

            if !loaded {
                debug!(instance_id = %key, "Initializing container");
                let service = Arc::clone(self);
                let slot = Arc::clone(&slot);
                let key = key.to_string();
                let dev_mode = self.dev_mode || deployment.is_dev();
                let idle_ttl = deployment.idle_ttl().or(self.default_idle_ttl);
                tokio::spawn(async move {
                    service.initialize(key, slot, phase_tx, dev_mode, idle_ttl).await;
                });
            }

            let mut phase = slot.phase.clone();
            let outcome = phase
                .wait_for(|p| !matches!(p, Phase::Initializing | Phase::Stopping))
                .await
                .map(|current| (*current).clone())
                .unwrap_or_else(|_| Phase::Failed(Arc::new(ContainerError::Aborted)));

            match outcome {
                Phase::Ready(container) => {
                    container.touch();
                    return Ok(container);
                }
                Phase::Failed(e) => return Err(e),
                Phase::Stopped => {
                    debug!(instance_id = %key, "Container stopped while waiting, starting over");
                }
                Phase::Initializing | Phase::Stopping => {
                    return Err(Arc::new(ContainerError::Aborted));
                }
            }
        }
    }

    /// Like [`get_or_create`](Self::get_or_create), but admits the request so
    /// the container cannot be stopped under it.
    pub async fn acquire(self: &Arc<Self>, deployment: &Deployment) -> Result<InFlight, Arc<ContainerError>> {
        loop {
            let container = self.get_or_create(deployment).await?;
            if let Some(guard) = container.enter() {
                return Ok(guard);
            }
            debug!(instance_id = %container.instance_id, "Container is stopping, waiting for a fresh one");
        }
    }

    pub fn state(&self, key: &str) -> ContainerState {
        let Some(slot) = self.table.load(&key.to_string()) else {
            return ContainerState::Absent;
        };
        let phase = slot.phase.borrow();
        match &*phase {
            Phase::Initializing => ContainerState::Initializing,
            Phase::Ready(_) => ContainerState::Ready,
            Phase::Stopping => ContainerState::Stopping,
            Phase::Stopped => ContainerState::Absent,
            Phase::Failed(_) => ContainerState::Failed,
        }
    }

    /// Number of keys in the table, in any phase
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Ready containers
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.table
            .values()
            .into_iter()
            .filter_map(|slot| {
                let phase = slot.phase.borrow();
                match &*phase {
                    Phase::Ready(container) => Some(Arc::clone(container)),
                    _ => None,
                }
            })
            .collect()
    }

    /// Stop containers idle for longer than their TTL. A container serving a
    /// request is never idle. Returns how many were asked to stop.
    pub fn cleanup_idle(&self) -> usize {
        let mut stopped = 0;
        for container in self.containers() {
            let Some(ttl) = container.idle_ttl else {
                continue;
            };
            if container.in_flight() > 0 {
                continue;
            }
            let idle = container.idle_for();
            if idle > ttl && container.request_stop() {
                info!(
                    instance_id = %container.instance_id,
                    idle_secs = idle.as_secs(),
                    "Container idle timeout reached"
                );
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop every ready container and wait until none is running
    pub async fn stop_all(&self) {
        for container in self.containers() {
            container.request_stop();
        }

        let deadline = Instant::now() + self.drain_timeout + self.grace_period + Duration::from_secs(2);
        while self.running() > 0 {
            if Instant::now() > deadline {
                warn!(remaining = self.running(), "Timed out waiting for containers to stop");
                return;
            }
            tokio::time::sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS)).await;
        }
    }

    /// Keys whose backend is up, ready or stopping
    fn running(&self) -> usize {
        self.table
            .values()
            .into_iter()
            .filter(|slot| matches!(&*slot.phase.borrow(), Phase::Ready(_) | Phase::Stopping))
            .count()
    }

    async fn initialize(
        self: Arc<Self>,
        key: String,
        slot: Arc<Slot>,
        phase_tx: watch::Sender<Phase>,
        dev_mode: bool,
        idle_ttl: Option<Duration>,
    ) {
        let result = AssertUnwindSafe(self.launch(&key, dev_mode, idle_ttl))
            .catch_unwind()
            .await
            .unwrap_or(Err(ContainerError::Aborted));

        match result {
            Ok((container, backend, stop_rx)) => {
                info!(
                    instance_id = %key,
                    port = container.port,
                    base_url = %container.base_url,
                    "Container ready"
                );
                phase_tx.send_replace(Phase::Ready(Arc::clone(&container)));
                tokio::spawn(self.supervise(key, slot, phase_tx, container, backend, stop_rx));
            }
            Err(e) => {
                error!(instance_id = %key, error = %e, "Container initialization failed");
                self.evict(&key, &slot);
                phase_tx.send_replace(Phase::Failed(Arc::new(e)));
            }
        }
    }

    async fn launch(
        &self,
        key: &str,
        dev_mode: bool,
        idle_ttl: Option<Duration>,
    ) -> Result<(Arc<Container>, Box<dyn RunningBackend>, oneshot::Receiver<()>), ContainerError> {
        let port = self.ports.allocate_port()?;
        let spec = BackendSpec::new(&self.data_root, key, port, dev_mode);

        for dir in spec.directories() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ContainerError::Workspace {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let mut backend = self.launcher.launch(&spec).await?;
        backend.wait_ready().await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let now = Instant::now();
        let container = Arc::new(Container {
            instance_id: key.to_string(),
            port,
            base_url: spec.base_url(),
            idle_ttl,
            started_at: now,
            last_activity: Mutex::new(now),
            in_flight: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
        });
        Ok((container, backend, stop_rx))
    }

    async fn supervise(
        self: Arc<Self>,
        key: String,
        slot: Arc<Slot>,
        phase_tx: watch::Sender<Phase>,
        container: Arc<Container>,
        mut backend: Box<dyn RunningBackend>,
        stop_rx: oneshot::Receiver<()>,
    ) {
        let exited = tokio::select! {
            status = backend.wait_exit() => Some(status),
            _ = stop_rx => None,
        };

        // Phase before flag: a caller refused by `enter` must find the slot stopping.
        phase_tx.send_replace(Phase::Stopping);
        container.stopping.store(true, Ordering::SeqCst);

        match exited {
            Some(status) => {
                warn!(instance_id = %key, port = container.port, %status, "Backend exited");
            }
            None => {
                self.drain(&container).await;
                backend.stop(self.grace_period).await;
            }
        }

        self.evict(&key, &slot);
        phase_tx.send_replace(Phase::Stopped);
        info!(
            instance_id = %key,
            uptime_secs = container.uptime().as_secs(),
            "Container removed"
        );
    }

    async fn drain(&self, container: &Container) {
        let started = Instant::now();
        while container.in_flight() > 0 {
            if started.elapsed() > self.drain_timeout {
                warn!(
                    instance_id = %container.instance_id,
                    remaining = container.in_flight(),
                    "Drain timeout exceeded, stopping anyway"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS)).await;
        }
        let drained_in = started.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(
                instance_id = %container.instance_id,
                drained_in_ms = drained_in.as_millis() as u64,
                "Drained in-flight requests"
            );
        }
    }

    /// Remove `key` only if it still maps to `slot`
    fn evict(&self, key: &str, slot: &Arc<Slot>) {
        self.table
            .delete_if(&key.to_string(), |current| Arc::ptr_eq(current, slot));
    }
}
