//! lvmvold - LVM volume plugin daemon.
//!
//! Serves the container runtime's volume plugin protocol over a unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lvmvol::{DeviceGateway, DriverConfig, MemoryGateway, SystemGateway, VolumeDriver};
use lvmvol_common::paths::{DEFAULT_SOCKET, LVM_HOME, LVM_VG_CONFIG};
use tokio::net::UnixListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,

    /// Directory holding volume mountpoints and metadata
    #[arg(long, default_value_os_t = LVM_HOME.to_path_buf())]
    home: PathBuf,

    /// File naming the volume group, as VOLUME_GROUP=<name>
    #[arg(long, default_value_os_t = LVM_VG_CONFIG.to_path_buf())]
    config: PathBuf,

    /// Unix socket to serve the plugin API on
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Keep volumes in memory instead of touching LVM
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let gateway: Arc<dyn DeviceGateway> = if args.dry_run {
        tracing::warn!("Dry run, volumes are kept in memory only");
        Arc::new(MemoryGateway::new())
    } else {
        if !SystemGateway::mkfs_available() {
            anyhow::bail!("'mkfs.xfs' executable not found, install xfsprogs");
        }
        Arc::new(SystemGateway::new())
    };

    let config = DriverConfig::default()
        .with_home(&args.home)
        .with_vg_config(&args.config);
    config
        .paths
        .create_dirs()
        .with_context(|| format!("failed to create {}", args.home.display()))?;

    let driver = Arc::new(VolumeDriver::open(&config, gateway)?);
    let listener = bind(&args.socket)?;

    tracing::info!(socket = %args.socket.display(), "lvmvold listening");
    axum::serve(listener, api::server::app(driver))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("plugin server failed")?;

    if let Err(e) = std::fs::remove_file(&args.socket) {
        tracing::warn!(socket = %args.socket.display(), error = %e, "Failed to remove socket");
    }
    tracing::info!("lvmvold stopped");
    Ok(())
}

/// Bind the plugin socket, replacing one left behind by a previous run.
fn bind(socket: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match std::fs::remove_file(socket) {
        Ok(()) => tracing::debug!(socket = %socket.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to remove {}", socket.display()));
        }
    }
    UnixListener::bind(socket).with_context(|| format!("failed to bind {}", socket.display()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutting down");
}
