use axum::http::Method;

use crate::error::ApiError;

/// Protocol version whose clients speak the SSE transport.
pub const SSE_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Sse,
    StreamableHttp,
    WebSocket,
}

impl ConnectionType {
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias.to_ascii_lowercase().as_str() {
            "sse" | "server-sent-events" | "2024-11-05" => Some(ConnectionType::Sse),
            "streamable_http" | "streamable-http" | "http" | "2025-03-26" => {
                Some(ConnectionType::StreamableHttp)
            }
            "websocket" | "ws" => Some(ConnectionType::WebSocket),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionType::Sse => "sse",
            ConnectionType::StreamableHttp => "streamable_http",
            ConnectionType::WebSocket => "websocket",
        }
    }
}

/// What the request tells us about the transport it wants.
#[derive(Debug, Clone, Copy)]
pub struct TransportHints<'a> {
    pub explicit: Option<&'a str>,
    pub upgrade: bool,
    /// `Some` when the request addresses an existing session; carries that
    /// session's negotiated protocol version.
    pub session_version: Option<Option<&'a str>>,
    pub method: &'a Method,
}

pub fn resolve_connection_type(hints: TransportHints<'_>) -> Result<ConnectionType, ApiError> {
    if let Some(raw) = hints.explicit {
        let explicit = ConnectionType::from_alias(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unsupported connection type `{raw}`")))?;
        if hints.upgrade && explicit != ConnectionType::WebSocket {
            return Err(ApiError::BadRequest(format!(
                "websocket upgrade requested on a {} endpoint",
                explicit.label()
            )));
        }
        return Ok(explicit);
    }
    if hints.upgrade {
        return Ok(ConnectionType::WebSocket);
    }
    if let Some(Some(version)) = hints.session_version {
        return Ok(if version == SSE_PROTOCOL_VERSION {
            ConnectionType::Sse
        } else {
            ConnectionType::StreamableHttp
        });
    }
    Ok(if hints.method == Method::POST {
        ConnectionType::StreamableHttp
    } else {
        ConnectionType::Sse
    })
}
