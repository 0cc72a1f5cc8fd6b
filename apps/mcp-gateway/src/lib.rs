pub mod auth;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod liveness;
pub mod mcp;
pub mod metrics;
pub mod model;
pub mod routes;
pub mod runner;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;

use anyhow::Context;
use tokio::signal;
use tracing::info;

use crate::config::GatewayConfig;
use crate::dispatch::processor::{spawn_workers, JobProcessor};
use crate::runner::CloseReason;
use crate::state::AppState;

/// Run the gateway until ctrl-c, then tear down runner and client state.
pub async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config.clone())?;
    let shutdown = state.shutdown().clone();

    let workers = spawn_workers(
        JobProcessor::new(state.clone()),
        config.queue_workers,
        shutdown.child_token(),
    );
    let liveness = liveness::spawn_liveness(state.clone(), shutdown.child_token());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(
        listen_addr = %config.listen_addr,
        queue_backend = ?config.queue_backend,
        queue_workers = config.queue_workers,
        runner_keys = config.runner_keys.len(),
        api_keys = config.api_keys.len(),
        "mcp-gateway listening"
    );

    let app = routes::router(state.clone());
    let draining = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received; closing runners and sessions");
            draining.shutdown().cancel();
            // Open streams only end once their sessions and runners close.
            draining.sessions().stop_all().await;
            draining.runners().close_all(CloseReason::Shutdown).await;
        })
        .await
        .context("server shutdown with error")?;

    for worker in workers {
        worker.abort();
    }
    liveness.abort();
    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
