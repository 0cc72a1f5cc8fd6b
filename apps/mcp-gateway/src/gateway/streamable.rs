use std::convert::Infallible;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::sse::{message_event, sse_response};
use crate::mcp;
use crate::session::{lagged_error, SessionEvent, TransportGuard};

/// `POST`: one message or a batch. Replies stream back as SSE events and
/// the stream ends once every request was answered.
pub async fn post_messages(transport: TransportGuard, body: &[u8]) -> Response {
    let body: Value = match serde_json::from_slice(body) {
        Ok(body) => body,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(mcp::parse_error(err))).into_response(),
    };

    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for message in mcp::split_batch(body) {
        match mcp::classify(&message) {
            Ok(_) => valid.push(message),
            Err(err) => rejected.push(mcp::invalid_request(mcp::salvage_id(&message), &err)),
        }
    }

    if !valid.iter().any(mcp::is_request) {
        if !valid.is_empty() {
            transport.connection().send_messages(valid).await;
        }
        if rejected.is_empty() {
            return StatusCode::ACCEPTED.into_response();
        }
        let stream = stream::iter(rejected)
            .map(|message| Ok::<_, Infallible>(message_event(&message, None)));
        return sse_response(stream);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    for message in rejected {
        let _ = tx.send(message);
    }
    tokio::spawn(async move {
        transport
            .connection()
            .send_messages_and_wait(valid, |reply| {
                let _ = tx.send(reply);
            })
            .await;
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|message| Ok::<_, Infallible>(message_event(&message, None)));
    sse_response(stream)
}

/// `GET`: reopen the session stream, replaying what the client missed after
/// `last_event_id`.
pub fn resume_stream(
    transport: TransportGuard,
    last_event_id: Option<u64>,
    include_debug: bool,
) -> Response {
    let replay = last_event_id
        .map(|last| transport.connection().replay_after(last))
        .unwrap_or_default();
    let subscription = transport.subscribe(include_debug);
    let replayed_up_to = replay
        .last()
        .map(|(id, _)| *id)
        .or(last_event_id)
        .unwrap_or(0);

    let replay = stream::iter(replay).map(|(id, message)| message_event(&message, Some(id)));
    let live = subscription
        .into_stream()
        .filter_map(move |event| async move {
            match event {
                SessionEvent::Message { event_id, message } if event_id > replayed_up_to => {
                    Some(message_event(&message, Some(event_id)))
                }
                SessionEvent::Message { .. } | SessionEvent::Closed => None,
                SessionEvent::Debug(message) => Some(message_event(&message, None)),
                SessionEvent::Lagged { skipped } => Some(message_event(&lagged_error(skipped), None)),
            }
        });
    sse_response(replay.chain(live).map(Ok::<_, Infallible>))
}
