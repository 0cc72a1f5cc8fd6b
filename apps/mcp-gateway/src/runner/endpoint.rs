use std::sync::{Arc, Weak};

use interconnect::{Endpoint, HandlerError};
use serde_json::Value;

use super::connection::RunnerConnection;
use super::messages::{
    RunClosedParams, RunErrorParams, RunMessageParams, SetConfigParams, SetConfigReply, READY,
    RUN_CLOSED, RUN_ERROR, RUN_MESSAGE, SET_CONFIG,
};

/// Handlers see the connection weakly so a lingering handler task never
/// keeps a closed connection alive.
pub type RunnerContext = Weak<RunnerConnection>;

/// Handlers for everything a runner may send to the gateway.
pub fn runner_endpoint() -> Arc<Endpoint<RunnerContext>> {
    let endpoint = Endpoint::new()
        .request(SET_CONFIG, set_config)
        .notification(READY, |ctx: RunnerContext, _: Value| async move {
            if let Some(connection) = ctx.upgrade() {
                connection.mark_ready().await;
            }
        })
        .notification(RUN_MESSAGE, |ctx: RunnerContext, params: RunMessageParams| async move {
            let Some(connection) = ctx.upgrade() else {
                return;
            };
            if let Some(broker) = connection.ready_broker(RUN_MESSAGE) {
                broker.handle_message(&params.server_run_id, params.message);
            }
        })
        .notification(RUN_CLOSED, |ctx: RunnerContext, params: RunClosedParams| async move {
            let Some(connection) = ctx.upgrade() else {
                return;
            };
            if let Some(broker) = connection.ready_broker(RUN_CLOSED) {
                broker.handle_closed(&params.server_run_id).await;
            }
        })
        .notification(RUN_ERROR, |ctx: RunnerContext, params: RunErrorParams| async move {
            if let Some(connection) = ctx.upgrade() {
                connection.record_run_error(params).await;
            }
        });
    Arc::new(endpoint)
}

async fn set_config(
    ctx: RunnerContext,
    params: SetConfigParams,
) -> Result<SetConfigReply, HandlerError> {
    let connection = ctx
        .upgrade()
        .ok_or_else(|| HandlerError::new("connection_closed", "connection is gone"))?;
    connection.set_config(params).await
}
