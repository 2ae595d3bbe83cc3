//! portald - GPU instance session lifecycle service
//!
//! Loads configuration, starts the service and runs it until a signal
//! arrives.

use anyhow::{Context, Result};
use clap::Parser;
use portal_config::load_config;
use portal_util::default_config_path;
use portald::{Service, ServicePaths};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// portald - Start, stop and reap GPU instance sessions
#[derive(Parser, Debug)]
#[command(name = "portald")]
#[command(about = "GPU instance session lifecycle service", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/gpuportal/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set PORTAL_SOCKET env var)
    #[arg(short, long, env = "PORTAL_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set PORTAL_DATA_DIR env var)
    #[arg(short, long, env = "PORTAL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Resolve once SIGTERM, SIGINT or SIGHUP arrives
async fn wait_for_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
        _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "portald starting");

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    info!(
        config_path = %args.config.display(),
        users = config.users.len(),
        instances = config.instances.len(),
        "Configuration loaded"
    );

    let service = Service::new(
        config,
        ServicePaths {
            socket: args.socket,
            data_dir: args.data_dir,
        },
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut running = tokio::spawn(service.run(shutdown_rx));

    tokio::select! {
        result = &mut running => return result.context("Service task panicked")?,
        signalled = wait_for_signal() => signalled?,
    }

    let _ = shutdown_tx.send(true);
    running.await.context("Service task panicked")?
}
