//! Capsule Daemon - manages atomically-updatable OS package images.
//!
//! Mounts verified capsule images, tracks what is active, and drives
//! staged install sessions across reboots, reverting them when a boot
//! goes unconfirmed.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use capsuled::config;
use capsuled::rpc_server::{self, DaemonState};
use capsuled::state::{self, Core};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("[BOOT] capsuled v{} starting...", env!("CARGO_PKG_VERSION"));

    if !nix::unistd::Uid::effective().is_root() {
        warn!("[BOOT] Not running as root; device and mount operations will fail");
    }

    let config = config::load_config().context("Failed to load configuration")?;

    if let Err(e) = state::prepare_directories(&config) {
        error!("[FATAL] Cannot create state directories: {}", e);
        std::process::exit(1);
    }

    // Reconcile with the live mount table, run revert-on-boot recovery
    // and activate sessions staged for this boot, all before accepting
    // any request.
    let mut core = Core::new(config.clone());
    if let Err(e) = core.startup() {
        error!("[FATAL] Boot recovery failed: {:#}", e);
        std::process::exit(1);
    }
    info!("[BOOT] Recovery complete");

    let state = Arc::new(DaemonState::new(core));
    rpc_server::start_server(state, &config.socket_path).await
}
