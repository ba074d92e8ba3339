//! Fleet Node Manager
//!
//! Long-running daemon that sizes a cloud node pool to a job queue's demand.
//! Reads `FLEET_CONFIG` (default `/etc/fleet/node-manager.toml`), runs until
//! SIGINT or SIGTERM, then drains node actors and exits. Exits non-zero when
//! actors had to be aborted at the drain deadline.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_node_manager::cloud::{driver_from_config, CloudAdapter};
use fleet_node_manager::events::TracingSink;
use fleet_node_manager::queue::queue_from_config;
use fleet_node_manager::{Config, FleetContext, Supervisor};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so its level applies
    let config = Config::from_env().context("loading configuration")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cloud_driver = ?config.cloud.driver,
        queue_driver = ?config.queue.driver,
        owner_tag = %config.cloud.owner_tag,
        sizes = config.sizes.len(),
        "Configuration loaded"
    );

    let driver = driver_from_config(&config.cloud)?;
    let queue = queue_from_config(&config.queue)?;
    let cloud = CloudAdapter::from_config(driver, &config);
    let ctx = FleetContext::new(config, cloud, Arc::new(TracingSink));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(Supervisor::new(ctx, queue).run(shutdown_rx));

    wait_for_signal().await;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    let report = supervisor.await.context("supervisor task panicked")?;
    if !report.is_clean() {
        error!(aborted = report.aborted, "Node manager stopped with aborted actors");
        std::process::exit(1);
    }

    info!("Node manager shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
