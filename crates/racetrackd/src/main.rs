//! racetrackd — the Racetrack daemon.
//!
//! Single binary that assembles all Racetrack subsystems:
//! - Registry store (redb)
//! - Infrastructure targets (Docker / Kubernetes / remote gateways)
//! - Job type catalog
//! - Deployment pipeline + image builder client
//! - Registry reconciler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! racetrackd run --config /etc/racetrack/racetrack.toml
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use racetrack_api::ApiState;
use racetrack_infra::{JobTypeCatalog, TargetProvider, TargetRegistry};
use racetrack_pipeline::{
    AllowAll, DeploymentPipeline, NoopEndpointRegistrar, PipelineConfig, RemoteImageBuilder,
    TracingAuditLog,
};
use racetrack_reconcile::Reconciler;

use config::{ConfiguredBackends, RacetrackConfig};

#[derive(Parser)]
#[command(name = "racetrackd", about = "Racetrack daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lifecycle engine.
    Run {
        /// Path to the TOML config file.
        #[arg(long, default_value = "/etc/racetrack/racetrack.toml")]
        config: PathBuf,

        /// Override the configured API port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,racetrackd=debug,racetrack=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => {
            let mut config = RacetrackConfig::load(&config)?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            run(config).await
        }
    }
}

async fn run(config: RacetrackConfig) -> anyhow::Result<()> {
    info!("Racetrack daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("racetrack.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // Registry store.
    let store = racetrack_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "registry store opened");

    // Infrastructure targets and job types.
    let provider: Arc<dyn TargetProvider> = ConfiguredBackends::from_config(&config).into_provider();
    let providers = vec![provider];

    let targets = TargetRegistry::new();
    targets.rebuild(&providers);
    info!(targets = ?targets.names(), "infrastructure targets registered");

    let job_types = JobTypeCatalog::new();
    job_types.rebuild(&providers);
    info!(job_types = ?job_types.keys(), "job types installed");

    // Deployment pipeline.
    let builder = Arc::new(RemoteImageBuilder::new(&config.image_builder_url));
    let pipeline = DeploymentPipeline::new(
        store.clone(),
        targets.clone(),
        job_types.clone(),
        builder,
        Arc::new(AllowAll),
        Arc::new(NoopEndpointRegistrar),
        Arc::new(TracingAuditLog),
        PipelineConfig {
            default_target: config.default_target.clone(),
            docker_registry: config.docker_registry.clone(),
            registry_namespace: config.registry_namespace.clone(),
        },
    );
    info!(builder = %config.image_builder_url, "deployment pipeline initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    // Reconciliation loop.
    let reconciler = Reconciler::new(store.clone(), targets.clone(), job_types.clone());
    let reconcile_handle = reconciler.spawn(
        Duration::from_secs(config.reconcile_interval),
        shutdown_rx.clone(),
    );
    info!(interval = config.reconcile_interval, "reconciler started");

    // ── Start API server ───────────────────────────────────────

    let router = racetrack_api::build_router(ApiState {
        store,
        pipeline,
        targets,
        job_types,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = reconcile_handle.await;

    info!("Racetrack daemon stopped");
    Ok(())
}
