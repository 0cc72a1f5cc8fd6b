use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IcError;

/// One interconnect frame as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: String,
        name: String,
        #[serde(default)]
        payload: Value,
    },
    Notification {
        name: String,
        #[serde(default)]
        payload: Value,
    },
    Response {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl Frame {
    pub fn success(id: String, payload: Value) -> Self {
        Frame::Response {
            id,
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(id: String, error: ErrorPayload) -> Self {
        Frame::Response {
            id,
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    pub fn encode(&self) -> Result<String, IcError> {
        serde_json::to_string(self).map_err(|err| IcError::Encode(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, IcError> {
        serde_json::from_str(text).map_err(|err| IcError::MalformedFrame(err.to_string()))
    }
}
