use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use super::connection::{CloseReason, RunnerConnection, WireFrame};
use crate::auth::fingerprint;
use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;

const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct RunnerQuery {
    metorial_runner_connection_key: Option<String>,
}

/// Runner ids are derived from the connection key so a reconnecting runner
/// keeps its identity.
pub fn runner_id_for_key(key: &str) -> String {
    format!("runner_{}", &fingerprint(key)[..16])
}

pub async fn runner_socket(
    State(state): State<AppState>,
    Query(query): Query<RunnerQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(key) = query
        .metorial_runner_connection_key
        .filter(|key| state.config().runner_keys.contains(key))
    else {
        metrics::RUNNER_AUTH_FAILURES.inc();
        warn!("runner connection rejected: unknown connection key");
        return ApiError::Unauthorized.into_response();
    };
    let Some(ws) = ws else {
        return ApiError::BadRequest("expected a websocket upgrade".into()).into_response();
    };
    let runner_id = runner_id_for_key(&key);
    ws.on_upgrade(move |socket| serve_runner(socket, state, runner_id))
}

async fn serve_runner(socket: WebSocket, state: AppState, runner_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (connection, mut outbound) = RunnerConnection::open(runner_id.clone(), state.runner_deps());
    let connection_id = connection.connection_id().to_string();
    info!(runner_id = %runner_id, connection_id = %connection_id, "runner connected");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                WireFrame::Text(text) => Message::Text(text),
                WireFrame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    connection.start();
    let cancel = connection.cancellation();
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            next = ws_rx.next() => match next {
                Some(Ok(Message::Text(text))) => connection.receive_text(&text),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => connection.receive_text(text),
                    Err(_) => warn!(runner_id = %runner_id, "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break Some(CloseReason::SocketClosed),
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(runner_id = %runner_id, error = %err, "runner socket error");
                    break Some(CloseReason::SocketError);
                }
            }
        }
    };

    if let Some(reason) = reason {
        connection.close(reason).await;
    }
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(runner_id = %runner_id, connection_id = %connection_id, "runner socket finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_id_is_stable_per_key() {
        let id = runner_id_for_key("rk-1");
        assert_eq!(id, runner_id_for_key("rk-1"));
        assert_ne!(id, runner_id_for_key("rk-2"));
        assert_eq!(id.len(), "runner_".len() + 16);
    }
}
