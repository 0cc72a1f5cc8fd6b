//! Records shared by the stores, the dispatch queue and the client gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// The authenticated caller of a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub organization_id: String,
    pub actor_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub organization_id: String,
    pub actor_id: String,
    pub server_instance_id: String,
    /// Negotiated on the first `initialize`; unset until then.
    pub mcp_version: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(actor: &Actor, server_instance_id: &str) -> Self {
        Self {
            id: new_id("ses"),
            organization_id: actor.organization_id.clone(),
            actor_id: actor.actor_id.clone(),
            server_instance_id: server_instance_id.to_string(),
            mcp_version: None,
            status: SessionStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.status == SessionStatus::Archived
    }

    pub fn job_payload(&self, server_deployment_id: &str) -> SessionJobPayload {
        SessionJobPayload {
            id: self.id.clone(),
            server_instance_id: self.server_instance_id.clone(),
            server_deployment_id: server_deployment_id.to_string(),
            mcp_version: self.mcp_version.clone(),
        }
    }
}

/// Queue-side projection of a [`Session`]. Carries ids only, never the
/// deployment itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionJobPayload {
    pub id: String,
    pub server_instance_id: String,
    pub server_deployment_id: String,
    #[serde(default)]
    pub mcp_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Closed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRun {
    pub id: String,
    pub status: RunStatus,
    pub server_deployment_id: String,
    pub runner_id: Option<String>,
    pub session_id: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ServerRun {
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }
}

/// Input for [`crate::store::ServerRunStore::create_for_session`].
#[derive(Debug, Clone)]
pub struct NewServerRun {
    pub session_id: String,
    pub server_deployment_id: String,
    pub runner_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    pub state: RunnerState,
    pub tags: Vec<String>,
    pub max_concurrent_jobs: u32,
    pub version: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInstance {
    pub id: String,
    pub server_id: String,
    pub organization_id: String,
    pub server_deployment_id: String,
}

/// Where a deployment's code comes from. Serialized with the same shape the
/// runner expects in `run/execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LaunchSource {
    Docker { image: String, tag: String },
    Remote { domain: String },
}

impl LaunchSource {
    pub fn is_remote(&self) -> bool {
        matches!(self, LaunchSource::Remote { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDeployment {
    pub id: String,
    pub server_id: String,
    pub server_version_id: String,
    pub source: LaunchSource,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErrorRecord {
    pub id: String,
    pub session_id: String,
    pub server_run_id: Option<String>,
    pub code: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl RunErrorRecord {
    pub fn new(
        session_id: &str,
        server_run_id: Option<&str>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id("rerr"),
            session_id: session_id.to_string(),
            server_run_id: server_run_id.map(str::to_string),
            code: code.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn launch_source_uses_runner_shape() {
        let docker = LaunchSource::Docker {
            image: "ghcr.io/acme/server".into(),
            tag: "1.2.0".into(),
        };
        assert_eq!(
            serde_json::to_value(&docker).unwrap(),
            json!({"type": "docker", "image": "ghcr.io/acme/server", "tag": "1.2.0"})
        );
        let remote: LaunchSource =
            serde_json::from_value(json!({"type": "remote", "domain": "mcp.acme.dev"})).unwrap();
        assert!(remote.is_remote());
    }

    #[test]
    fn job_payload_carries_ids_only() {
        let actor = Actor {
            organization_id: "org-1".into(),
            actor_id: "key_1".into(),
        };
        let session = Session::new(&actor, "inst-1");
        let payload = session.job_payload("dep-1");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["server_deployment_id"], "dep-1");
        assert_eq!(value["id"], session.id.as_str());
        assert!(session.id.starts_with("ses_"));
    }
}
