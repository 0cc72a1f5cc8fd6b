use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;

use crate::model::{ServerInstance, Session};

pub const MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");
pub const GATEWAY_SESSION_ID: HeaderName = HeaderName::from_static("metorial-gateway-session-id");
pub const GATEWAY_SERVER_ID: HeaderName = HeaderName::from_static("metorial-gateway-server-id");
pub const GATEWAY_SERVER_INSTANCE_ID: HeaderName =
    HeaderName::from_static("metorial-gateway-server-instance-id");
pub const INCLUDE_DEBUG: &str = "metorial-include-debug-messages";
pub const LAST_EVENT_ID: &str = "last-event-id";

/// Stamp the session identification headers onto a response.
pub fn with_session_headers(
    mut response: Response,
    session: &Session,
    instance: &ServerInstance,
) -> Response {
    let headers = response.headers_mut();
    for (name, value) in [
        (MCP_SESSION_ID, session.id.as_str()),
        (GATEWAY_SESSION_ID, session.id.as_str()),
        (GATEWAY_SERVER_ID, instance.server_id.as_str()),
        (GATEWAY_SERVER_INSTANCE_ID, instance.id.as_str()),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
    response
}

pub fn include_debug(headers: &HeaderMap) -> bool {
    headers
        .get(INCLUDE_DEBUG)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&MCP_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

pub fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}
