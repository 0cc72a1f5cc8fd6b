use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{new_id, SessionJobPayload};

/// Work items carried by the dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum Job {
    /// Place a session on a hosted (docker) runner.
    #[serde(rename = "srr/run/host")]
    RunHost { session: SessionJobPayload },
    /// Place a session whose deployment lives on a remote endpoint.
    #[serde(rename = "srr/run/external")]
    RunExternal { session: SessionJobPayload },
    /// Unregister a runner that stopped heartbeating.
    #[serde(rename = "srn/run/stop")]
    StopRunner {
        #[serde(rename = "runnerId")]
        runner_id: String,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::RunHost { .. } => "srr/run/host",
            Job::RunExternal { .. } => "srr/run/external",
            Job::StopRunner { .. } => "srn/run/stop",
        }
    }

    pub fn session(&self) -> Option<&SessionJobPayload> {
        match self {
            Job::RunHost { session } | Job::RunExternal { session } => Some(session),
            Job::StopRunner { .. } => None,
        }
    }
}

/// A job plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    /// 1-based delivery attempt.
    pub attempt: u32,
    pub job: Job,
}

impl QueuedJob {
    pub fn new(job: Job) -> Self {
        Self {
            id: new_id("job"),
            attempt: 1,
            job,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            id: self.id.clone(),
            attempt: self.attempt + 1,
            job: self.job.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before re-delivering after `attempt` failed: base, 2x base, 4x...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1 << exponent)
    }
}
