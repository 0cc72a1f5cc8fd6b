//! Periodic sweep for runners that stopped heartbeating. The sweep only
//! enqueues `srn/run/stop`; the queue consumer re-checks before acting.

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::jobs::Job;
use crate::dispatch::DispatchError;
use crate::metrics;
use crate::state::AppState;

/// Enqueue a stop job for every online runner past its deadline. Returns how
/// many were enqueued.
pub async fn sweep_once(state: &AppState) -> Result<usize, DispatchError> {
    let stale_after = chrono::Duration::from_std(state.config().liveness.stale_after)
        .unwrap_or_else(|_| chrono::Duration::minutes(1));
    let stale = state
        .stores()
        .runners
        .stale_online_runners(Utc::now() - stale_after)
        .await?;

    let mut enqueued = 0;
    for runner in stale {
        metrics::LIVENESS_STALE.inc();
        info!(runner_id = %runner.id, last_seen_at = %runner.last_seen_at, "runner missed its heartbeat deadline");
        state
            .dispatcher()
            .enqueue(Job::StopRunner {
                runner_id: runner.id,
            })
            .await?;
        enqueued += 1;
    }
    Ok(enqueued)
}

pub fn spawn_liveness(state: AppState, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config().liveness.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match sweep_once(&state).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "liveness sweep enqueued stop jobs"),
                Err(err) => warn!(error = %err, "liveness sweep failed"),
            }
        }
    })
}
