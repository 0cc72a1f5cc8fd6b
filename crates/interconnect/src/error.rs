use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IcError {
    #[error("interconnect connection closed")]
    ConnectionClosed,
    #[error("request `{name}` timed out")]
    Timeout { name: String },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid payload for `{name}`: {message}")]
    InvalidPayload { name: String, message: String },
    #[error("no handler registered for `{0}`")]
    UnknownMethod(String),
    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl IcError {
    /// Stable label used for metrics and error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            IcError::ConnectionClosed => "connection_closed",
            IcError::Timeout { .. } => "timeout",
            IcError::MalformedFrame(_) => "malformed_frame",
            IcError::InvalidPayload { .. } => "invalid_payload",
            IcError::UnknownMethod(_) => "unknown_method",
            IcError::Remote { .. } => "remote_error",
            IcError::Encode(_) => "encode_error",
        }
    }
}
