use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::jobs::{Job, QueuedJob};
use super::{DispatchError, EXTERNAL_TAG, HOSTED_TAG};
use crate::broker::BrokerRunManager;
use crate::metrics;
use crate::model::{NewServerRun, RunErrorRecord, RunStatus, RunnerState, SessionJobPayload};
use crate::runner::CloseReason;
use crate::state::AppState;
use crate::store::RunCreation;

const DEQUEUE_WAIT: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer side of the dispatch queue.
#[derive(Clone)]
pub struct JobProcessor {
    state: AppState,
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobProcessor {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub async fn handle(&self, queued: QueuedJob) {
        let name = queued.job.name();
        let result = match &queued.job {
            Job::RunHost { session } => self.launch(session, HOSTED_TAG).await,
            Job::RunExternal { session } => self.launch(session, EXTERNAL_TAG).await,
            Job::StopRunner { runner_id } => self.stop_runner(runner_id).await,
        };
        let Err(err) = result else {
            metrics::DISPATCH_JOBS.with_label_values(&[name, "ok"]).inc();
            return;
        };

        let retry = self.state.dispatcher().retry_policy();
        if err.retryable() && retry.should_retry(queued.attempt) {
            metrics::DISPATCH_JOBS.with_label_values(&[name, "retry"]).inc();
            info!(
                job_id = %queued.id,
                job = name,
                attempt = queued.attempt,
                error = %err,
                "job failed; scheduling retry"
            );
            self.state.dispatcher().schedule_retry(&queued);
            return;
        }

        metrics::DISPATCH_JOBS.with_label_values(&[name, "failed"]).inc();
        warn!(job_id = %queued.id, job = name, attempt = queued.attempt, error = %err, "job failed");
        if let Some(session) = queued.job.session() {
            let record = RunErrorRecord::new(&session.id, None, err.code(), err.to_string());
            if let Err(store_err) = self.state.stores().errors.record_error(record).await {
                warn!(session_id = %session.id, error = %store_err, "failed to record dispatch error");
            }
            self.state.dispatcher().complete(&session.id, Err(err));
        }
    }

    /// Place the session on a runner carrying `tag`, unless it already has a
    /// live run. Waiters are resolved on success; failures are left to
    /// [`JobProcessor::handle`].
    async fn launch(&self, payload: &SessionJobPayload, tag: &str) -> Result<(), DispatchError> {
        let lock = Arc::clone(
            self.locks
                .entry(payload.id.clone())
                .or_default()
                .value(),
        );
        let guard = lock.lock().await;
        let result = self.launch_locked(payload, tag).await;
        drop(guard);
        self.locks
            .remove_if(&payload.id, |_, held| Arc::strong_count(held) == 2);

        match result {
            Ok(run) => {
                self.state.dispatcher().complete(&payload.id, Ok(run));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn launch_locked(
        &self,
        payload: &SessionJobPayload,
        tag: &str,
    ) -> Result<BrokerRunManager, DispatchError> {
        let stores = self.state.stores();
        let session = stores
            .sessions
            .get_session(&payload.id)
            .await?
            .ok_or_else(|| DispatchError::SessionNotFound(payload.id.clone()))?;
        if session.is_archived() {
            return Err(DispatchError::SessionArchived(session.id));
        }

        if let Some(active) = stores.runs.active_run_for_session(&session.id).await? {
            match self.state.runners().find_run(&active.id) {
                Some(run) if !run.is_closed() => {
                    debug!(session_id = %session.id, run_id = %active.id, "session already has a live run");
                    return Ok(run);
                }
                _ => {
                    info!(session_id = %session.id, run_id = %active.id, "failing run left without a runner");
                    stores
                        .runs
                        .finish_run(&active.id, RunStatus::Failed, Some("runner_disconnected"))
                        .await?;
                }
            }
        }

        let deployment = stores
            .directory
            .deployment(&payload.server_deployment_id)
            .await?
            .ok_or_else(|| DispatchError::DeploymentNotFound(payload.server_deployment_id.clone()))?;

        let runner = self
            .state
            .runners()
            .select(&session.id, tag)
            .ok_or_else(|| DispatchError::NoRunner(tag.to_string()))?;

        let run = match stores
            .runs
            .create_for_session(NewServerRun {
                session_id: session.id.clone(),
                server_deployment_id: deployment.id.clone(),
                runner_id: runner.runner_id().to_string(),
            })
            .await?
        {
            RunCreation::Created(run) => run,
            RunCreation::Existing(run) => {
                return self.state.runners().find_run(&run.id).ok_or_else(|| {
                    DispatchError::RunnerUnavailable(format!("run {} has no live runner", run.id))
                });
            }
        };

        info!(
            session_id = %session.id,
            run_id = %run.id,
            runner_id = %runner.runner_id(),
            tag,
            "dispatching run"
        );
        let run_id = run.id.clone();
        match runner.assign(run, deployment).await {
            Ok(manager) => Ok(manager),
            Err(err) => {
                stores
                    .runs
                    .finish_run(&run_id, RunStatus::Failed, Some(err.code()))
                    .await?;
                Err(err)
            }
        }
    }

    /// Unregister a runner the liveness sweep found stale, after checking it
    /// did not come back in the meantime.
    async fn stop_runner(&self, runner_id: &str) -> Result<(), DispatchError> {
        let stores = self.state.stores();
        let Some(runner) = stores.runners.get_runner(runner_id).await? else {
            debug!(runner_id, "stop requested for unknown runner");
            return Ok(());
        };
        if runner.state == RunnerState::Offline {
            return Ok(());
        }
        let stale_after = chrono::Duration::from_std(self.state.config().liveness.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(1));
        if runner.last_seen_at >= Utc::now() - stale_after {
            debug!(runner_id, "runner heartbeated since the sweep; keeping it");
            return Ok(());
        }

        match self.state.runners().get(runner_id) {
            Some(connection)
                if connection.last_pong_elapsed() < self.state.config().heartbeat.timeout =>
            {
                debug!(runner_id, "runner connection is still heartbeating; keeping it");
                return Ok(());
            }
            Some(connection) => {
                connection.close(CloseReason::Unregistered).await;
            }
            None => stores.runners.mark_offline(runner_id).await?,
        }
        let failed = stores
            .runs
            .fail_runs_for_runner(runner_id, "runner_disconnected")
            .await?;
        info!(runner_id, failed_runs = failed, "stale runner unregistered");
        Ok(())
    }
}

/// Spawn `count` queue consumers that run until `cancel` fires.
pub fn spawn_workers(
    processor: JobProcessor,
    count: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let processor = processor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let queue = Arc::clone(processor.state.dispatcher().queue());
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = queue.dequeue(DEQUEUE_WAIT) => next,
                    };
                    match next {
                        Ok(Some(job)) => processor.handle(job).await,
                        Ok(None) => {}
                        Err(err) => {
                            warn!(worker, error = %err, "dequeue failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
                debug!(worker, "queue worker stopped");
            })
        })
        .collect()
}
