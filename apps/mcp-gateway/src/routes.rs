use axum::{
    http::header,
    response::IntoResponse,
    routing::{any, get},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::gateway;
use crate::metrics;
use crate::runner::socket::runner_socket;
use crate::state::AppState;

pub const RUNNER_INTERCONNECT_PATH: &str = "/metorial_runner_interconnect";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route(RUNNER_INTERCONNECT_PATH, get(runner_socket))
        .route("/:server_instance_id", any(gateway::handle))
        .route("/:server_instance_id/:connection_type", any(gateway::handle))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
