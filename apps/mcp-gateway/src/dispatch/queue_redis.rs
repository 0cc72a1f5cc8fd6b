use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::warn;

use super::jobs::QueuedJob;
use super::queue::{JobQueue, QueueError};

const LIST_JOBS: &str = "mcp-gateway:dispatch:jobs";
const MAX_LIST_LEN: isize = 10_000;
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Job queue backed by one Redis list. Producers `RPUSH`, consumers `LPOP`.
pub struct RedisJobQueue {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisJobQueue {
    pub fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> redis::RedisResult<ConnectionManager> {
        self.conn
            .get_or_try_init(|| self.client.get_connection_manager())
            .await
            .cloned()
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(LIST_JOBS, payload).await?;
        // Oldest jobs go first when the list overflows.
        let _: () = redis::cmd("LTRIM")
            .arg(LIST_JOBS)
            .arg(-MAX_LIST_LEN)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut conn = self.conn().await?;
        loop {
            let item: Option<String> = conn.lpop(LIST_JOBS, None).await?;
            match item {
                Some(payload) => match serde_json::from_str::<QueuedJob>(&payload) {
                    Ok(job) => return Ok(Some(job)),
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable job");
                        continue;
                    }
                },
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(IDLE_POLL.min(deadline - now)).await;
                }
            }
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(LIST_JOBS).await?)
    }
}
