use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::model::{
    new_id, NewServerRun, RunErrorRecord, RunStatus, Runner, RunnerState, ServerDeployment,
    ServerInstance, ServerRun, Session, SessionStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid catalog: {0}")]
    Catalog(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: Session) -> Result<Session, StoreError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Store the negotiated protocol version unless one is already set.
    /// Returns the version the session ends up with.
    async fn set_mcp_version(&self, id: &str, version: &str) -> Result<String, StoreError>;

    async fn archive_session(&self, id: &str) -> Result<(), StoreError>;
}

/// Outcome of [`ServerRunStore::create_for_session`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunCreation {
    Created(ServerRun),
    /// The session already had an active run; nothing was inserted.
    Existing(ServerRun),
}

#[async_trait]
pub trait ServerRunStore: Send + Sync {
    /// Insert an active run for the session unless one is already active.
    async fn create_for_session(&self, run: NewServerRun) -> Result<RunCreation, StoreError>;

    async fn get_run(&self, id: &str) -> Result<Option<ServerRun>, StoreError>;

    /// Move an active run to a terminal status. Terminal runs are left as
    /// they are; returns whether anything changed.
    async fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn runs_for_session(&self, session_id: &str) -> Result<Vec<ServerRun>, StoreError>;

    async fn active_run_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ServerRun>, StoreError> {
        Ok(self
            .runs_for_session(session_id)
            .await?
            .into_iter()
            .find(ServerRun::is_active))
    }

    /// Fail every active run placed on the runner. Returns how many moved.
    async fn fail_runs_for_runner(&self, runner_id: &str, reason: &str)
        -> Result<usize, StoreError>;
}

#[async_trait]
pub trait RunnerStore: Send + Sync {
    async fn upsert_runner(&self, runner: Runner) -> Result<(), StoreError>;

    async fn get_runner(&self, id: &str) -> Result<Option<Runner>, StoreError>;

    async fn touch_runner(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn mark_offline(&self, id: &str) -> Result<(), StoreError>;

    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError>;

    /// Online runners whose last heartbeat is older than `cutoff`.
    async fn stale_online_runners(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Runner>, StoreError> {
        Ok(self
            .list_runners()
            .await?
            .into_iter()
            .filter(|r| r.state == RunnerState::Online && r.last_seen_at < cutoff)
            .collect())
    }
}

#[async_trait]
pub trait RunErrorStore: Send + Sync {
    async fn record_error(&self, record: RunErrorRecord) -> Result<(), StoreError>;

    async fn errors_for_session(&self, session_id: &str)
        -> Result<Vec<RunErrorRecord>, StoreError>;
}

/// Read-only view of server instances and their deployments.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    async fn server_instance(&self, id: &str) -> Result<Option<ServerInstance>, StoreError>;

    async fn deployment(&self, id: &str) -> Result<Option<ServerDeployment>, StoreError>;
}

/// Handles to every persistence collaborator.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub runs: Arc<dyn ServerRunStore>,
    pub runners: Arc<dyn RunnerStore>,
    pub errors: Arc<dyn RunErrorStore>,
    pub directory: Arc<dyn InstanceDirectory>,
}

impl Stores {
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            sessions: store.clone(),
            runs: store.clone(),
            runners: store.clone(),
            errors: store.clone(),
            directory: store,
        }
    }
}

/// Seed data for the in-memory directory.
#[derive(Debug, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub instances: Vec<ServerInstance>,
    #[serde(default)]
    pub deployments: Vec<ServerDeployment>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// In-memory adapter for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    runs: Mutex<Vec<ServerRun>>,
    runners: Mutex<HashMap<String, Runner>>,
    errors: Mutex<Vec<RunErrorRecord>>,
    instances: Mutex<HashMap<String, ServerInstance>>,
    deployments: Mutex<HashMap<String, ServerDeployment>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_catalog(catalog: Catalog) -> Arc<Self> {
        let instances = catalog
            .instances
            .into_iter()
            .map(|instance| (instance.id.clone(), instance))
            .collect();
        let deployments = catalog
            .deployments
            .into_iter()
            .map(|deployment| (deployment.id.clone(), deployment))
            .collect();
        Arc::new(Self {
            instances: Mutex::new(instances),
            deployments: Mutex::new(deployments),
            ..Self::default()
        })
    }

    pub async fn insert_instance(&self, instance: ServerInstance) {
        self.instances
            .lock()
            .await
            .insert(instance.id.clone(), instance);
    }

    pub async fn insert_deployment(&self, deployment: ServerDeployment) {
        self.deployments
            .lock()
            .await
            .insert(deployment.id.clone(), deployment);
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        self.sessions
            .lock()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn set_mcp_version(&self, id: &str, version: &str) -> Result<String, StoreError> {
        let mut guard = self.sessions.lock().await;
        let session = guard.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "session",
            id: id.to_string(),
        })?;
        Ok(session
            .mcp_version
            .get_or_insert_with(|| version.to_string())
            .clone())
    }

    async fn archive_session(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.sessions.lock().await;
        let session = guard.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "session",
            id: id.to_string(),
        })?;
        session.status = SessionStatus::Archived;
        Ok(())
    }
}

#[async_trait]
impl ServerRunStore for InMemoryStore {
    async fn create_for_session(&self, run: NewServerRun) -> Result<RunCreation, StoreError> {
        let mut guard = self.runs.lock().await;
        if let Some(existing) = guard
            .iter()
            .find(|r| r.session_id == run.session_id && r.is_active())
        {
            return Ok(RunCreation::Existing(existing.clone()));
        }
        let created = ServerRun {
            id: new_id("srun"),
            status: RunStatus::Active,
            server_deployment_id: run.server_deployment_id,
            runner_id: Some(run.runner_id),
            session_id: run.session_id,
            failure_reason: None,
            created_at: Utc::now(),
            ended_at: None,
        };
        guard.push(created.clone());
        Ok(RunCreation::Created(created))
    }

    async fn get_run(&self, id: &str) -> Result<Option<ServerRun>, StoreError> {
        Ok(self.runs.lock().await.iter().find(|r| r.id == id).cloned())
    }

    async fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.runs.lock().await;
        let Some(run) = guard.iter_mut().find(|r| r.id == id) else {
            return Err(StoreError::NotFound {
                kind: "server run",
                id: id.to_string(),
            });
        };
        if !run.is_active() || status == RunStatus::Active {
            return Ok(false);
        }
        run.status = status;
        run.failure_reason = reason.map(str::to_string);
        run.ended_at = Some(Utc::now());
        Ok(true)
    }

    async fn runs_for_session(&self, session_id: &str) -> Result<Vec<ServerRun>, StoreError> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn fail_runs_for_runner(
        &self,
        runner_id: &str,
        reason: &str,
    ) -> Result<usize, StoreError> {
        let mut guard = self.runs.lock().await;
        let now = Utc::now();
        let mut moved = 0;
        for run in guard
            .iter_mut()
            .filter(|r| r.is_active() && r.runner_id.as_deref() == Some(runner_id))
        {
            run.status = RunStatus::Failed;
            run.failure_reason = Some(reason.to_string());
            run.ended_at = Some(now);
            moved += 1;
        }
        Ok(moved)
    }
}

#[async_trait]
impl RunnerStore for InMemoryStore {
    async fn upsert_runner(&self, runner: Runner) -> Result<(), StoreError> {
        self.runners
            .lock()
            .await
            .insert(runner.id.clone(), runner);
        Ok(())
    }

    async fn get_runner(&self, id: &str) -> Result<Option<Runner>, StoreError> {
        Ok(self.runners.lock().await.get(id).cloned())
    }

    async fn touch_runner(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(runner) = self.runners.lock().await.get_mut(id) {
            runner.last_seen_at = at;
        }
        Ok(())
    }

    async fn mark_offline(&self, id: &str) -> Result<(), StoreError> {
        if let Some(runner) = self.runners.lock().await.get_mut(id) {
            runner.state = RunnerState::Offline;
        }
        Ok(())
    }

    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError> {
        Ok(self.runners.lock().await.values().cloned().collect())
    }
}

#[async_trait]
impl RunErrorStore for InMemoryStore {
    async fn record_error(&self, record: RunErrorRecord) -> Result<(), StoreError> {
        self.errors.lock().await.push(record);
        Ok(())
    }

    async fn errors_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<RunErrorRecord>, StoreError> {
        Ok(self
            .errors
            .lock()
            .await
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InstanceDirectory for InMemoryStore {
    async fn server_instance(&self, id: &str) -> Result<Option<ServerInstance>, StoreError> {
        Ok(self.instances.lock().await.get(id).cloned())
    }

    async fn deployment(&self, id: &str) -> Result<Option<ServerDeployment>, StoreError> {
        Ok(self.deployments.lock().await.get(id).cloned())
    }
}
