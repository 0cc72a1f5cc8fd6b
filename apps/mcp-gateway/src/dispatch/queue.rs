use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::jobs::QueuedJob;
use crate::config::QueueBackend;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("job encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable job queue. Delivery is at-least-once; consumers must tolerate
/// duplicates.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Next job, or `None` if the queue stayed empty for `wait`.
    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError>;

    async fn len(&self) -> Result<usize, QueueError>;
}

pub type QueueHandle = Arc<dyn JobQueue>;

pub fn build_queue(backend: QueueBackend, redis_url: Option<&str>) -> QueueHandle {
    match backend {
        QueueBackend::InMemory => Arc::new(InMemoryJobQueue::new()),
        QueueBackend::Redis => {
            if let Some(url) = redis_url {
                match super::queue_redis::RedisJobQueue::connect(url) {
                    Ok(queue) => return Arc::new(queue),
                    Err(err) => {
                        warn!(error = %err, "failed to init redis queue; falling back to memory")
                    }
                }
            } else {
                warn!("queue backend is redis but REDIS_URL is missing; falling back to in-memory");
            }
            Arc::new(InMemoryJobQueue::new())
        }
    }
}

/// Process-local queue. Jobs do not survive a restart.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<VecDeque<QueuedJob>>,
    available: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        self.jobs.lock().push_back(job);
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            if let Some(job) = self.jobs.lock().pop_front() {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.jobs.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::jobs::Job;

    fn stop(runner: &str) -> QueuedJob {
        QueuedJob::new(Job::StopRunner {
            runner_id: runner.into(),
        })
    }

    #[tokio::test]
    async fn dequeues_in_insertion_order() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(stop("runner_a")).await.unwrap();
        queue.enqueue(stop("runner_b")).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.job, Job::StopRunner { runner_id: "runner_a".into() });
        assert_eq!(second.job, Job::StopRunner { runner_id: "runner_b".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn empty_dequeue_times_out() {
        let queue = InMemoryJobQueue::new();
        assert!(queue.dequeue(Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waiting_consumer_is_woken() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(stop("runner_c")).await.unwrap();
        let job = consumer.await.unwrap().unwrap().expect("job delivered");
        assert_eq!(job.job.name(), "srn/run/stop");
    }

    #[test]
    fn redis_without_url_falls_back() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let queue = build_queue(QueueBackend::Redis, None);
            queue.enqueue(stop("runner_d")).await.unwrap();
            assert_eq!(queue.len().await.unwrap(), 1);
        });
    }
}
