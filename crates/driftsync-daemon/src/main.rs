//! driftsync daemon - background synchronization service
//!
//! Assembles the [`Core`] service graph, runs the startup sequence (vault
//! recovery, deferred database opening), then waits for SIGTERM/SIGINT and
//! shuts down gracefully: watchers stopped, tasks cancelled cooperatively,
//! vault sealed.

mod core;
mod credentials;
mod database;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use driftsync_core::config::Config;

use crate::core::Core;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load_or_default(&config_path);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!(
        config_path = %config_path.display(),
        config_dir = %config.config_dir.display(),
        "Starting driftsyncd"
    );

    let (core, mut event_rx) = Core::build(config);

    core.startup().await.context("Startup failed")?;

    // Drain the to-frontend stream; the GUI transport attaches here. Without
    // one, events are logged at debug for troubleshooting.
    let event_pump = tokio::spawn(async move {
        while let Some(envelope) = event_rx.recv().await {
            tracing::debug!(
                event = %envelope.event,
                seq = envelope.seq,
                "Frontend event"
            );
        }
    });

    // Graceful shutdown on SIGTERM or SIGINT
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "Failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        shutdown.cancel();
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                info!("Received interrupt");
            }
            shutdown.cancel();
        });
    }

    shutdown.cancelled().await;
    info!("Shutting down...");

    core.shutdown().await;
    event_pump.abort();

    info!("driftsyncd stopped");
    Ok(())
}
