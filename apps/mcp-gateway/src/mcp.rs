//! JSON-RPC message handling for client traffic. Messages are relayed as raw
//! JSON values; this module only classifies them and builds the error and
//! debug frames the gateway emits itself.

use serde_json::{json, Map, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const SERVER_ERROR: i64 = -32000;

pub const DEBUG_METHOD: &str = "metorial/debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("`jsonrpc` must be \"2.0\"")]
    WrongVersion,
    #[error("`method` must be a string")]
    BadMethod,
    #[error("`id` must be a string or a number")]
    BadId,
    #[error("message is neither a request, a notification nor a response")]
    Unrecognized,
}

pub fn classify(message: &Value) -> Result<MessageKind, InvalidMessage> {
    let object = message.as_object().ok_or(InvalidMessage::NotAnObject)?;
    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(InvalidMessage::WrongVersion);
    }
    if let Some(id) = object.get("id") {
        if !(id.is_string() || id.is_number() || (id.is_null() && !object.contains_key("method")))
        {
            return Err(InvalidMessage::BadId);
        }
    }
    match object.get("method") {
        Some(Value::String(_)) if object.contains_key("id") => Ok(MessageKind::Request),
        Some(Value::String(_)) => Ok(MessageKind::Notification),
        Some(_) => Err(InvalidMessage::BadMethod),
        None if object.contains_key("id")
            && (object.contains_key("result") || object.contains_key("error")) =>
        {
            Ok(MessageKind::Response)
        }
        None => Err(InvalidMessage::Unrecognized),
    }
}

pub fn is_request(message: &Value) -> bool {
    classify(message) == Ok(MessageKind::Request)
}

/// Key identifying a request id. `1` and `"1"` are different ids.
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

pub fn request_id_key(message: &Value) -> Option<String> {
    is_request(message).then(|| id_key(&message["id"]))
}

pub fn response_id_key(message: &Value) -> Option<String> {
    (classify(message) == Ok(MessageKind::Response)).then(|| id_key(&message["id"]))
}

/// Best-effort id of a message that failed validation, for the error reply.
pub fn salvage_id(message: &Value) -> Value {
    match message.get("id") {
        Some(id) if id.is_string() || id.is_number() => id.clone(),
        _ => Value::Null,
    }
}

pub fn error_response(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Value {
    let mut error = Map::new();
    error.insert("code".into(), json!(code));
    error.insert("message".into(), Value::String(message.into()));
    if let Some(data) = data {
        error.insert("data".into(), data);
    }
    json!({"jsonrpc": "2.0", "id": id, "error": Value::Object(error)})
}

pub fn parse_error(detail: impl std::fmt::Display) -> Value {
    error_response(Value::Null, PARSE_ERROR, format!("parse error: {detail}"), None)
}

pub fn invalid_request(id: Value, err: &InvalidMessage) -> Value {
    error_response(id, INVALID_REQUEST, format!("invalid request: {err}"), None)
}

/// Gateway-side failure surfaced to the client in place of a server reply.
pub fn gateway_error(id: Value, code: &str, message: impl Into<String>) -> Value {
    error_response(id, SERVER_ERROR, message, Some(json!({ "code": code })))
}

pub fn debug_notification(kind: &str, extra: Value) -> Value {
    let mut params = match extra {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    params.insert("type".into(), Value::String(kind.to_string()));
    json!({"jsonrpc": "2.0", "method": DEBUG_METHOD, "params": Value::Object(params)})
}

/// `params.protocolVersion` of an `initialize` request, if that is what this is.
pub fn initialize_protocol_version(message: &Value) -> Option<&str> {
    if message.get("method").and_then(Value::as_str) != Some("initialize") {
        return None;
    }
    message
        .get("params")
        .and_then(|params| params.get("protocolVersion"))
        .and_then(Value::as_str)
}

/// A POST body: one message or a batch array.
pub fn split_batch(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        single => vec![single],
    }
}
