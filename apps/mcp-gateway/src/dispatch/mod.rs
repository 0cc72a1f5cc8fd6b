//! Placing sessions on runners.
//!
//! Client-facing code calls [`Dispatcher::dispatch`], which enqueues one job
//! per session (concurrent callers for the same session share it) and waits
//! for the [`processor`] to report the launched run back through
//! [`Dispatcher::complete`].

pub mod jobs;
pub mod processor;
pub mod queue;
pub mod queue_redis;
pub mod select;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::broker::BrokerRunManager;
use crate::config::DispatchConfig;
use crate::model::{ServerDeployment, Session};
use crate::store::StoreError;

use jobs::{Job, QueuedJob, RetryPolicy};
use queue::{QueueError, QueueHandle};

/// Runner tag required for `srr/run/host`.
pub const HOSTED_TAG: &str = "docker";
/// Runner tag required for `srr/run/external`.
pub const EXTERNAL_TAG: &str = "external";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no ready runner tagged `{0}` has capacity")]
    NoRunner(String),
    #[error("runner unavailable: {0}")]
    RunnerUnavailable(String),
    #[error("launch parameters rejected: {0}")]
    LaunchRejected(String),
    #[error("runner failed to start the run: {0}")]
    LaunchFailed(String),
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("session `{0}` is archived")]
    SessionArchived(String),
    #[error("deployment `{0}` not found")]
    DeploymentNotFound(String),
    #[error("timed out waiting for a runner")]
    Timeout,
    #[error("dispatch was abandoned")]
    Abandoned,
    #[error("queue unavailable: {0}")]
    Queue(String),
    #[error("store error: {0}")]
    Store(String),
}

impl DispatchError {
    /// Whether another delivery of the job could succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::NoRunner(_)
                | DispatchError::RunnerUnavailable(_)
                | DispatchError::LaunchFailed(_)
                | DispatchError::Store(_)
        )
    }

    /// Stable code surfaced to clients in `error.data.code`.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NoRunner(_) | DispatchError::RunnerUnavailable(_) => "runner_unavailable",
            DispatchError::LaunchRejected(_) => "launch_params_rejected",
            DispatchError::LaunchFailed(_) => "run_launch_failed",
            DispatchError::SessionNotFound(_) | DispatchError::DeploymentNotFound(_) => "not_found",
            DispatchError::SessionArchived(_) => "session_archived",
            DispatchError::Timeout => "dispatch_timeout",
            DispatchError::Abandoned => "dispatch_abandoned",
            DispatchError::Queue(_) => "queue_unavailable",
            DispatchError::Store(_) => "internal",
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        DispatchError::Store(err.to_string())
    }
}

impl From<QueueError> for DispatchError {
    fn from(err: QueueError) -> Self {
        DispatchError::Queue(err.to_string())
    }
}

type DispatchResult = Result<BrokerRunManager, DispatchError>;

pub struct Dispatcher {
    queue: QueueHandle,
    waiters: DashMap<String, Vec<oneshot::Sender<DispatchResult>>>,
    wait_timeout: Duration,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(queue: QueueHandle, config: &DispatchConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            waiters: DashMap::new(),
            wait_timeout: config.wait_timeout,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_base: config.backoff_base,
            },
        })
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Request a run for `session` and wait until a runner has started it.
    pub async fn dispatch(
        &self,
        session: &Session,
        deployment: &ServerDeployment,
    ) -> DispatchResult {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = self.waiters.entry(session.id.clone()).or_default();
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(tx);
            waiters.len() == 1
        };

        if first {
            let payload = session.job_payload(&deployment.id);
            let job = if deployment.source.is_remote() {
                Job::RunExternal { session: payload }
            } else {
                Job::RunHost { session: payload }
            };
            debug!(session_id = %session.id, job = job.name(), "enqueueing dispatch");
            if let Err(err) = self.queue.enqueue(QueuedJob::new(job)).await {
                warn!(session_id = %session.id, error = %err, "failed to enqueue dispatch");
                let err = DispatchError::from(err);
                self.complete(&session.id, Err(err.clone()));
                return Err(err);
            }
        }

        match tokio::time::timeout(self.wait_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::Abandoned),
            Err(_) => Err(DispatchError::Timeout),
        }
    }

    /// Resolve every caller waiting on `session_id`.
    pub fn complete(&self, session_id: &str, result: DispatchResult) {
        if let Some((_, waiters)) = self.waiters.remove(session_id) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    pub async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.queue.enqueue(QueuedJob::new(job)).await
    }

    /// Re-deliver a failed job after its backoff.
    pub fn schedule_retry(&self, job: &QueuedJob) {
        let delay = self.retry.backoff(job.attempt);
        let next = job.next_attempt();
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = queue.enqueue(next).await {
                warn!(error = %err, "failed to re-enqueue job");
            }
        });
    }

    pub fn waiting_sessions(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::{InMemoryJobQueue, JobQueue};
    use crate::model::{Actor, LaunchSource};
    use serde_json::json;
    use test_timeout::tokio_timeout_test;

    fn session() -> Session {
        Session::new(
            &Actor {
                organization_id: "org-1".into(),
                actor_id: "key_1".into(),
            },
            "inst-1",
        )
    }

    fn deployment(source: LaunchSource) -> ServerDeployment {
        ServerDeployment {
            id: "dep-1".into(),
            server_id: "srv-1".into(),
            server_version_id: "ver-1".into(),
            source,
            config: json!({}),
        }
    }

    #[test]
    fn error_codes_and_retry_classes() {
        assert!(DispatchError::NoRunner("docker".into()).retryable());
        assert_eq!(
            DispatchError::NoRunner("docker".into()).code(),
            "runner_unavailable"
        );
        assert!(!DispatchError::LaunchRejected("bad".into()).retryable());
        assert!(!DispatchError::Timeout.retryable());
    }

    #[tokio_timeout_test(5)]
    async fn concurrent_dispatches_share_one_job() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Dispatcher::new(queue.clone(), &DispatchConfig::default());
        let session = session();
        let remote = deployment(LaunchSource::Remote {
            domain: "mcp.acme.dev".into(),
        });

        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            let (session, remote) = (session.clone(), remote.clone());
            tokio::spawn(async move { dispatcher.dispatch(&session, &remote).await })
        };
        let second = {
            let dispatcher = Arc::clone(&dispatcher);
            let (session, remote) = (session.clone(), remote.clone());
            tokio::spawn(async move { dispatcher.dispatch(&session, &remote).await })
        };
        while dispatcher.waiters.get(&session.id).map(|w| w.len()).unwrap_or(0) < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.len().await.unwrap(), 1);
        let job = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(job.job.name(), "srr/run/external");

        dispatcher.complete(&session.id, Err(DispatchError::NoRunner(EXTERNAL_TAG.into())));
        assert_eq!(
            first.await.unwrap().err(),
            Some(DispatchError::NoRunner(EXTERNAL_TAG.into()))
        );
        assert!(second.await.unwrap().is_err());
        assert_eq!(dispatcher.waiting_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let config = DispatchConfig {
            wait_timeout: Duration::from_secs(2),
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::new(queue.clone(), &config);
        let docker = deployment(LaunchSource::Docker {
            image: "ghcr.io/acme/server".into(),
            tag: "latest".into(),
        });
        let session = session();
        let result = dispatcher.dispatch(&session, &docker).await;
        assert_eq!(result.err(), Some(DispatchError::Timeout));

        // The expired waiter does not suppress the next enqueue.
        let queued = queue.dequeue(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(queued.job.name(), "srr/run/host");
        let pending = {
            let dispatcher = Arc::clone(&dispatcher);
            let docker = docker.clone();
            let session = session.clone();
            tokio::spawn(async move { dispatcher.dispatch(&session, &docker).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len().await.unwrap(), 1);
        pending.abort();
    }
}
