use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_orchestration::{DeviceManager, EventHub, TaskManager, LOG_CHANNEL_CAPACITY};
use fleetd::config::{resolve_data_dir, DaemonConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "fleetd", version)]
#[command(about = "Fleet task orchestrator agent")]
struct Cli {
    /// Address for the agent API (overrides `[server] bind`)
    #[arg(long)]
    bind: Option<String>,

    /// State directory (or use FLEETD_DATA_DIR); defaults to ~/.fleetd
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to fleetd.toml (or use FLEETD_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let data_dir = resolve_data_dir(cli.data_dir);
    let config = DaemonConfig::resolve(cli.config.as_deref(), &data_dir)?;
    let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address {bind}"))?;

    info!(version = DAEMON_VERSION, data_dir = %data_dir.display(), "fleetd starting");

    let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let hub = Arc::new(EventHub::new());
    hub.spawn_log_pump(log_rx);

    let devices = DeviceManager::open(&data_dir, config.supervisor, config.fleet, Some(log_tx))
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
    let devices = Arc::new(devices);

    let (tasks, fired) = TaskManager::new(Arc::clone(&devices), Arc::clone(&hub));
    let tasks = Arc::new(tasks);
    tasks.bootstrap().await;
    let background = tasks.spawn_background(fired);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind agent API to {addr}"))?;
    info!(%addr, device_id = %devices.local_id(), "agent API listening");

    let (stopping_tx, stopping_rx) = watch::channel(false);
    let app = fleetd::router_with_shutdown(Arc::clone(&tasks), stopping_rx);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Ends open event streams so the drain can finish.
            let _ = stopping_tx.send(true);
        })
        .await
        .context("agent API encountered an unrecoverable error")?;

    for handle in background {
        handle.abort();
    }
    // Supervised children keep running; the next start re-attaches to them.
    info!("fleetd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C; shutting down"),
        _ = terminate => info!("Received SIGTERM; shutting down"),
    }
}
