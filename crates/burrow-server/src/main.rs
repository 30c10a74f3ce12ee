//! Burrow server entry point.
//!
//! Serves the instance API and terminal WebSockets until interrupted.
//! Shutdown detaches live terminal sessions but leaves every instance and
//! its container in place.

use anyhow::Context;
use burrow_core::{InstanceStore, JsonFileStore, MemoryStore};
use burrow_engine::DockerEngine;
use burrow_server::{http, AppState, BurrowConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("burrow_server=info".parse()?)
                .add_directive("burrow_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Burrow server");

    let config = BurrowConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate().context("invalid configuration")?;
    config.validate_warn();

    let engine = match &config.docker_host {
        Some(host) => DockerEngine::connect(host),
        None => DockerEngine::connect_local(),
    }
    .context("failed to create Docker client")?;
    engine
        .ping()
        .await
        .context("Docker engine is not reachable")?;
    tracing::info!("Connected to Docker engine");

    let store: Arc<dyn InstanceStore> = match &config.state_file {
        Some(path) => {
            let store = JsonFileStore::open(path)
                .await
                .with_context(|| format!("failed to open state file {}", path.display()))?;
            tracing::info!(path = %path.display(), "Using file-backed registry");
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let state = AppState::new(
        Arc::new(engine),
        store,
        config.controller_config()?,
        config.session_config()?,
        Arc::new(config.identity()?),
    );

    match state.controller.reconcile().await {
        Ok(report) if report.is_clean() => tracing::info!("Registry matches engine"),
        Ok(report) => tracing::warn!(
            missing = report.missing_containers.len(),
            orphaned = report.orphaned_containers.len(),
            "Registry drift detected at startup"
        ),
        Err(e) => tracing::warn!(error = %e, "Startup reconcile failed"),
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = state.clone();
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        if let Err(e) = http::serve(http_state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());

    let detached = state.bridge.detach_all();
    if state.bridge.drain(DRAIN_TIMEOUT).await {
        tracing::info!(detached, "Terminal sessions closed");
    } else {
        tracing::warn!(
            remaining = state.bridge.active_sessions(),
            "Timed out waiting for terminal sessions to close"
        );
    }

    let _ = http_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
