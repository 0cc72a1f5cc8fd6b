//! Client-facing MCP endpoint. One route serves every transport; the
//! connection type is resolved per request and the exchange is bridged to
//! the session's [`SessionConnection`](crate::session::SessionConnection).

pub mod connection_type;
pub mod headers;
pub mod resolve;
pub mod sse;
pub mod streamable;
pub mod websocket;

use axum::{
    body::Bytes,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use crate::auth::BearerToken;
use crate::error::ApiError;
use crate::metrics;
use crate::model::Session;
use crate::session::TransportGuard;
use crate::state::AppState;

use connection_type::{resolve_connection_type, ConnectionType, TransportHints};
use resolve::Target;

#[derive(Debug, Deserialize)]
pub struct GatewayPath {
    server_instance_id: String,
    connection_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GatewayQuery {
    session_id: Option<String>,
}

#[allow(clippy::too_many_arguments)]
pub async fn handle(
    State(state): State<AppState>,
    Path(path): Path<GatewayPath>,
    Query(query): Query<GatewayQuery>,
    method: Method,
    headers: HeaderMap,
    token: Option<BearerToken>,
    ws: Option<WebSocketUpgrade>,
    body: Bytes,
) -> Response {
    match route(state, path, query, method, headers, token, ws, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn route(
    state: AppState,
    path: GatewayPath,
    query: GatewayQuery,
    method: Method,
    headers: HeaderMap,
    token: Option<BearerToken>,
    ws: Option<WebSocketUpgrade>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let target = resolve::authorize(&state, token, &path.server_instance_id).await?;

    let requested_session = headers::session_id(&headers).or(query.session_id);
    let existing = resolve::existing_session(&state, &target, requested_session.as_deref()).await?;

    let connection_type = resolve_connection_type(TransportHints {
        explicit: path.connection_type.as_deref(),
        upgrade: headers::wants_websocket(&headers),
        session_version: existing.as_ref().map(|session| session.mcp_version.as_deref()),
        method: &method,
    })?;
    debug!(
        server_instance_id = %target.instance.id,
        connection_type = connection_type.label(),
        method = %method,
        session_id = ?existing.as_ref().map(|session| session.id.as_str()),
        "client request"
    );

    let include_debug = headers::include_debug(&headers);
    let has_session = existing.is_some();
    match (connection_type, &method) {
        (ConnectionType::Sse, &Method::POST) if !has_session => Err(ApiError::BadRequest(
            "cannot message an empty session".into(),
        )),
        (ConnectionType::StreamableHttp, &Method::GET) | (_, &Method::DELETE) if !has_session => {
            Err(session_required())
        }
        (ConnectionType::Sse | ConnectionType::StreamableHttp, &Method::DELETE) => {
            let session = existing.ok_or_else(session_required)?;
            state.sessions().stop(&session.id).await;
            Ok(headers::with_session_headers(
                StatusCode::OK.into_response(),
                &session,
                &target.instance,
            ))
        }
        (ConnectionType::WebSocket, &Method::GET) => {
            let ws = ws.ok_or_else(|| ApiError::BadRequest("expected a websocket upgrade".into()))?;
            let (exchange, transport) = Exchange::open(&state, target, existing, connection_type).await?;
            let response = ws.on_upgrade(move |socket| {
                websocket::serve_client(socket, transport, include_debug)
            });
            Ok(exchange.finish(response))
        }
        (ConnectionType::Sse, &Method::GET) => {
            let (exchange, transport) = Exchange::open(&state, target, existing, connection_type).await?;
            let endpoint_url = exchange.created.then(|| {
                format!(
                    "{}/{}/sse?session_id={}",
                    state.config().public_base_url,
                    exchange.instance_id(),
                    exchange.session_id()
                )
            });
            let response = sse::open_stream(transport, endpoint_url, include_debug);
            Ok(exchange.finish(response))
        }
        (ConnectionType::Sse, &Method::POST) => {
            let (exchange, transport) = Exchange::open(&state, target, existing, connection_type).await?;
            let response = sse::post_message(transport, &body).await?;
            Ok(exchange.finish(response))
        }
        (ConnectionType::StreamableHttp, &Method::POST) => {
            let (exchange, transport) = Exchange::open(&state, target, existing, connection_type).await?;
            let response = streamable::post_messages(transport, &body).await;
            Ok(exchange.finish(response))
        }
        (ConnectionType::StreamableHttp, &Method::GET) => {
            let (exchange, transport) = Exchange::open(&state, target, existing, connection_type).await?;
            let response = streamable::resume_stream(
                transport,
                headers::last_event_id(&headers),
                include_debug,
            );
            Ok(exchange.finish(response))
        }
        _ => Err(ApiError::MethodNotAllowed),
    }
}

fn session_required() -> ApiError {
    ApiError::BadRequest("an existing session id is required".into())
}

/// The session a request resolved to. The transport attached to its relay
/// is handed out separately so streams can outlive the response headers.
struct Exchange {
    target: Target,
    session: Session,
    created: bool,
}

impl Exchange {
    async fn open(
        state: &AppState,
        target: Target,
        existing: Option<Session>,
        connection_type: ConnectionType,
    ) -> Result<(Self, TransportGuard), ApiError> {
        let (session, created) = match existing {
            Some(session) => (session, false),
            None => (resolve::create_session(state, &target).await?, true),
        };
        let transport = state.sessions().attach(
            session.clone(),
            target.instance.clone(),
            target.deployment.clone(),
            &state.session_deps(),
        );
        metrics::CLIENT_CONNECTIONS
            .with_label_values(&[connection_type.label()])
            .inc();
        let exchange = Self {
            target,
            session,
            created,
        };
        Ok((exchange, transport))
    }

    fn instance_id(&self) -> &str {
        &self.target.instance.id
    }

    fn session_id(&self) -> &str {
        &self.session.id
    }

    fn finish(self, response: Response) -> Response {
        headers::with_session_headers(response, &self.session, &self.target.instance)
    }
}
