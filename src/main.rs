use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};

use sandman::api::{self, AppState};
use sandman::container::{ContainerRuntime, ContainerRuntimeApi};
use sandman::gpu::{GpuPool, NvidiaSmiInventory};
use sandman::identity::SshKeygenMinter;
use sandman::net::{IpPool, IpPoolConfig, PortPool};
use sandman::reaper::Reaper;
use sandman::session::{EngineConfig, SessionEngine, SessionRepository};
use sandman::workspace::WorkspaceManager;

/// GPU session orchestrator: provisions per-user SSH sandboxes on MIG
/// slices with a TTL reaper.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port the control-plane API listens on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to the session database
    #[arg(long, value_name = "PATH", default_value = "/var/lib/sandman/sessions.db")]
    db: PathBuf,

    /// Root directory for per-user persistent workspaces
    #[arg(long, value_name = "PATH", default_value = "/srv/workspaces")]
    workspace_root: PathBuf,

    /// First host port handed out for SSH forwarding
    #[arg(long, default_value_t = 10000)]
    ssh_port_start: u16,

    /// Last host port handed out for SSH forwarding
    #[arg(long, default_value_t = 20000)]
    ssh_port_end: u16,

    /// Directory holding the session Dockerfile and its companion files
    #[arg(long, value_name = "PATH", default_value = "/app/source")]
    build_context: PathBuf,

    /// Private bridge network sessions attach to
    #[arg(long, default_value = "sandman_worknet")]
    network: String,

    /// Subnet of the private bridge network
    #[arg(long, default_value = "10.100.0.0/16")]
    subnet: String,

    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Reduce output to only errors
    #[arg(short, long)]
    quiet: bool,

    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable debug logging (equivalent to -v)
    #[arg(long)]
    debug: bool,

    /// Enable trace logging (overrides other levels)
    #[arg(long)]
    trace: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.trace {
            "trace"
        } else if self.debug || self.verbose == 1 {
            "debug"
        } else if self.verbose >= 2 {
            "trace"
        } else {
            "info"
        }
    }
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    serve(cli)
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = cli.log_level();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sandman={level},tower_http={level}")));

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        let disable_color =
            std::env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
            .try_init()
            .ok();
    }
}

#[tokio::main]
async fn serve(cli: Cli) -> Result<()> {
    if cli.ssh_port_start == 0 || cli.ssh_port_start > cli.ssh_port_end {
        bail!(
            "invalid SSH port range {}-{}",
            cli.ssh_port_start,
            cli.ssh_port_end
        );
    }

    info!("starting GPU session orchestrator");

    let repo = SessionRepository::open(&cli.db)
        .await
        .context("opening session store")?;

    let runtime = ContainerRuntime::new();
    let version = runtime
        .health_check()
        .await
        .context("container runtime unavailable")?;
    debug!(runtime = %runtime.runtime_type(), version = %version.trim(), "container runtime ready");

    runtime
        .ensure_network(&cli.network, &cli.subnet)
        .await
        .context("ensuring private bridge network")?;

    let inventory = NvidiaSmiInventory::new();
    let gpus = Arc::new(
        GpuPool::discover(&inventory)
            .await
            .context("discovering GPU partitions")?,
    );

    let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(runtime);
    let ports = Arc::new(PortPool::new(cli.ssh_port_start, cli.ssh_port_end));
    let ip_config = IpPoolConfig::from_subnet(&cli.network, &cli.subnet)
        .context("parsing bridge subnet")?;
    let ips = Arc::new(IpPool::new(runtime.clone(), ip_config));

    let engine = Arc::new(SessionEngine::new(
        repo,
        runtime,
        gpus,
        ports,
        ips,
        Arc::new(SshKeygenMinter::new()),
        WorkspaceManager::new(&cli.workspace_root),
        EngineConfig {
            build_context: cli.build_context.clone(),
            network: cli.network.clone(),
            ..EngineConfig::default()
        },
    ));

    // Reconciliation makes the pools correct after a crash; it must finish
    // before the first request or sweep.
    engine
        .reconcile()
        .await
        .context("startup reconciliation")?;

    let reaper = Reaper::new(
        engine.clone(),
        Duration::from_secs(cli.sweep_interval_secs),
    )
    .start();

    let app = api::router(AppState::new(engine));
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .context("parsing bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving control plane")?;

    reaper.stop();
    info!("orchestrator shut down");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing SIGINT handler");
    };

    let terminate = async {
        signal(SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
