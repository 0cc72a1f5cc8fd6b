//! Interconnect method names and payloads spoken with runners.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::LaunchSource;

pub const SET_CONFIG: &str = "server/set_config";
pub const READY: &str = "server/ready";
pub const RUN_MESSAGE: &str = crate::broker::RUN_MESSAGE;
pub const RUN_CLOSED: &str = "run/closed";
pub const RUN_ERROR: &str = "run/error";
pub const GET_LAUNCH_PARAMS: &str = "get_launch_params";
pub const RUN_EXECUTE: &str = "run/execute";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConfigParams {
    #[serde(default)]
    pub tags: Vec<String>,
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConfigReply {
    pub status: String,
}

impl SetConfigReply {
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMessageParams {
    pub server_run_id: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunClosedParams {
    pub server_run_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorParams {
    pub server_run_id: String,
    pub error: RunErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLaunchParams {
    pub server_run_id: String,
    pub server_deployment_id: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LaunchParamsReply {
    #[serde(rename_all = "camelCase")]
    Success { launch_params: Value },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunExecuteParams {
    pub server_run_id: String,
    pub source: LaunchSource,
    pub launch_params: Value,
}
