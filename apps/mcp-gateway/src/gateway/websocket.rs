use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::mcp;
use crate::session::{lagged_error, SessionConnection, SessionEvent, TransportGuard};

/// Bridge one client socket to the session. Malformed frames are answered
/// in-band; the socket stays open. A client that falls too far behind gets a
/// `stream_lagged` error and is disconnected.
pub async fn serve_client(socket: WebSocket, transport: TransportGuard, include_debug: bool) {
    let connection = Arc::clone(transport.connection());
    let session_id = connection.session_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<Value>();
    let mut subscription = transport.subscribe(include_debug);

    let init = mcp::debug_notification("init", json!({ "sessionId": session_id }));
    let _ = local_tx.send(init);

    let mut writer = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                local = local_rx.recv() => match local {
                    Some(message) => message,
                    None => break,
                },
                event = subscription.next() => match event {
                    Some(SessionEvent::Message { message, .. }) | Some(SessionEvent::Debug(message)) => message,
                    Some(SessionEvent::Lagged { skipped }) => {
                        let _ = ws_tx.send(Message::Text(lagged_error(skipped).to_string())).await;
                        break;
                    }
                    Some(SessionEvent::Closed) | None => break,
                },
            };
            if ws_tx.send(Message::Text(outbound.to_string())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    info!(session_id = %session_id, "client websocket opened");
    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&connection, &local_tx, &text).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_frame(&connection, &local_tx, text).await,
                    Err(err) => {
                        let _ = local_tx.send(mcp::parse_error(err));
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(session_id = %session_id, error = %err, "client websocket error");
                    break;
                }
            }
        }
    }
    writer.abort();
    info!(session_id = %session_id, "client websocket closed");
}

async fn handle_frame(
    connection: &Arc<SessionConnection>,
    replies: &mpsc::UnboundedSender<Value>,
    text: &str,
) {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            let _ = replies.send(mcp::parse_error(err));
            return;
        }
    };
    if let Err(err) = mcp::classify(&message) {
        let _ = replies.send(mcp::invalid_request(mcp::salvage_id(&message), &err));
        return;
    }
    connection.send_messages(vec![message]).await;
}
