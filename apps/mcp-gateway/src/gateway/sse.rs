use std::convert::Infallible;

use axum::{
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::mcp;
use crate::session::{lagged_error, SessionEvent, TransportGuard};

/// `GET`: the session's event stream. A just-created session first learns
/// where to POST its messages.
pub fn open_stream(
    transport: TransportGuard,
    endpoint_url: Option<String>,
    include_debug: bool,
) -> Response {
    let session_id = transport.connection().session_id();
    let subscription = transport.subscribe(include_debug);
    let mut prelude = Vec::new();
    if let Some(url) = endpoint_url {
        prelude.push(Event::default().event("endpoint").data(url));
    }
    if include_debug {
        let init = mcp::debug_notification("init", json!({ "sessionId": session_id }));
        prelude.push(message_event(&init, None));
    }

    let stream = stream::iter(prelude)
        .chain(subscription.into_stream().filter_map(|event| async move {
            match event {
                SessionEvent::Message { event_id, message } => {
                    Some(message_event(&message, Some(event_id)))
                }
                SessionEvent::Debug(message) => Some(message_event(&message, None)),
                SessionEvent::Lagged { skipped } => Some(message_event(&lagged_error(skipped), None)),
                SessionEvent::Closed => None,
            }
        }))
        .map(Ok::<_, Infallible>);
    sse_response(stream)
}

/// `POST`: exactly one message, forwarded without waiting.
pub async fn post_message(transport: TransportGuard, body: &[u8]) -> Result<Response, ApiError> {
    let message: Value = serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid JSON body: {err}")))?;
    mcp::classify(&message).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    transport.connection().send_messages(vec![message]).await;
    Ok(StatusCode::ACCEPTED.into_response())
}

pub(super) fn message_event(message: &Value, event_id: Option<u64>) -> Event {
    let event = Event::default().event("message").data(message.to_string());
    match event_id {
        Some(id) => event.id(id.to_string()),
        None => event,
    }
}

pub(super) fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
