use std::sync::Arc;

use dashmap::DashMap;

use super::connection::{CloseReason, RunnerConnection};
use crate::broker::BrokerRunManager;
use crate::dispatch::select::{select_runner, RunnerCandidate};

/// Live runner connections keyed by runner id. At most one per runner.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    connections: Arc<DashMap<String, Arc<RunnerConnection>>>,
}

impl RunnerRegistry {
    /// Make `connection` the runner's live connection. Returns the one it
    /// replaced, if any.
    pub fn register(&self, connection: Arc<RunnerConnection>) -> Option<Arc<RunnerConnection>> {
        self.connections
            .insert(connection.runner_id().to_string(), connection)
    }

    /// Drop the entry only if it still belongs to `connection_id`.
    pub fn remove_if(&self, runner_id: &str, connection_id: &str) -> bool {
        self.connections
            .remove_if(runner_id, |_, live| live.connection_id() == connection_id)
            .is_some()
    }

    pub fn get(&self, runner_id: &str) -> Option<Arc<RunnerConnection>> {
        self.connections
            .get(runner_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn snapshot(&self) -> Vec<Arc<RunnerConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Ready runners carrying `tag`, with their current load.
    pub fn candidates(&self, tag: &str) -> Vec<RunnerCandidate> {
        self.snapshot()
            .into_iter()
            .filter(|connection| connection.is_ready() && connection.has_tag(tag))
            .filter_map(|connection| {
                let broker = connection.broker()?;
                Some(RunnerCandidate {
                    id: connection.runner_id().to_string(),
                    capacity: connection.capacity(),
                    load: broker.active_runs() as u32,
                })
            })
            .collect()
    }

    pub fn select(&self, session_id: &str, tag: &str) -> Option<Arc<RunnerConnection>> {
        let candidates = self.candidates(tag);
        select_runner(session_id, &candidates).and_then(|chosen| self.get(&chosen.id))
    }

    /// Find a still-open run on any live connection.
    pub fn find_run(&self, run_id: &str) -> Option<BrokerRunManager> {
        self.snapshot()
            .into_iter()
            .filter_map(|connection| connection.broker())
            .find_map(|broker| broker.run(run_id))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.snapshot().iter().filter(|c| c.is_ready()).count()
    }

    pub async fn close_all(&self, reason: CloseReason) {
        for connection in self.snapshot() {
            connection.close(reason).await;
        }
    }
}
