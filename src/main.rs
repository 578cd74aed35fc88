use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantgate::backend::ProcessLauncher;
use tenantgate::config::{Config, MachineProvider};
use tenantgate::container::ContainerService;
use tenantgate::deployment::DeploymentResolver;
use tenantgate::dispatch::Dispatcher;
use tenantgate::legacy::LegacyUpstream;
use tenantgate::machine::MachineInfo;
use tenantgate::mirror::Mirror;
use tenantgate::pool::{ConnectionPool, PoolConfig};
use tenantgate::proxy::{EdgeHeaders, ProxyServer};
use tenantgate::registry::RegistryClient;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Idle reaping runs this often
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "tenantgate", version, about = "Multi-tenant edge router")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides server.bind
    #[arg(long)]
    http: Option<String>,

    /// Dev mode: debug logging and dev-mode backends
    #[arg(long)]
    dev: bool,

    /// Run as this machine id with the local identity provider
    #[arg(long)]
    machine: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };
    apply_cli(&mut config, &cli);

    let default_directive = if config.server.dev_mode {
        "tenantgate=debug"
    } else {
        "tenantgate=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .init();

    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Configuration loaded");
    }
    config.validate()?;

    let machine = MachineInfo::from_config(&config.machine)?;
    print_startup_banner(&config, &machine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(RegistryClient::new(&config.registry)?);
    let mirror = Arc::new(Mirror::new(config.server.apex_domain.clone()));
    let mirror_handle = mirror.start(Arc::clone(&registry), shutdown_rx.clone());

    let launcher = Arc::new(ProcessLauncher::new(&config.containers));
    let containers = Arc::new(ContainerService::new(
        &config.containers,
        config.server.dev_mode,
        launcher,
    ));
    containers.start()?;

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    }));
    let legacy = LegacyUpstream::new(&config.legacy, &machine.machine_id, &config.server.header_prefix)?;
    if legacy.is_none() {
        info!("Legacy routing disabled (legacy.origin_url not set)");
    }

    let dispatcher = Arc::new(
        Dispatcher::new(
            DeploymentResolver::new(Arc::clone(&mirror)),
            Arc::clone(&containers),
            pool,
            legacy,
            machine.machine_id.clone(),
            config.server.request_timeout(),
        )
        .with_header_prefix(&config.server.header_prefix)?,
    );

    let bind_addr: SocketAddr = config.server.bind.parse().map_err(|e| {
        error!(bind = %config.server.bind, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address: {}", e)
    })?;
    let edge = EdgeHeaders::new(&config.server.header_prefix, &machine)?;
    let server = ProxyServer::new(bind_addr, dispatcher, edge, shutdown_rx.clone());

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let cleanup_containers = Arc::clone(&containers);
    let cleanup_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        idle_cleanup_loop(cleanup_containers, cleanup_shutdown_rx).await;
    });

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    info!(containers = containers.len(), "Stopping all containers...");
    containers.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = mirror_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(http) = &cli.http {
        config.server.bind = http.clone();
    }
    if cli.dev {
        config.server.dev_mode = true;
    }
    if let Some(machine_id) = &cli.machine {
        config.machine.provider = MachineProvider::Local;
        config.machine.machine_id = machine_id.clone();
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

async fn idle_cleanup_loop(containers: Arc<ContainerService>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {
                containers.cleanup_idle();
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config, machine: &MachineInfo) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge router");
    info!(
        machine_id = %machine.machine_id,
        region = %machine.region,
        private_ip = %machine.private_ip,
        dev_mode = config.server.dev_mode,
        "Machine identity"
    );
    info!(
        bind = %config.server.bind,
        apex_domain = ?config.server.apex_domain,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        registry = %config.registry.url,
        page_size = config.registry.page_size,
        "Registry settings"
    );
    info!(
        command = %config.containers.command,
        port_start = config.containers.port_start,
        port_end = config.containers.port_end,
        startup_timeout_secs = config.containers.startup_timeout_secs,
        shutdown_grace_period_secs = config.containers.shutdown_grace_period_secs,
        "Container settings"
    );
}
