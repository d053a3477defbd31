//! HTTP and WebSocket request handlers.

use crate::server::AppState;
use crate::ws;
use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use evalbridge_core::{BridgeError, CallContext, ServerConfig};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "session": state.broker.has_session(),
    }))
}

/// Evaluate the request body on the connected peer.
pub async fn handle_eval(State(state): State<Arc<AppState>>, code: String) -> Response {
    debug!("eval request ({} bytes)", code.len());
    let ctx = CallContext::with_timeout(state.eval_timeout);

    match state.broker.eval(code, &ctx).await {
        Ok(reply) => Json(json!({ "result": reply.result() })).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: BridgeError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warn!("eval failed ({}): {}", status, err);
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Accept the peer connection and run a session on it.
pub async fn handle_ws(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade
        .max_message_size(ServerConfig::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Peer connected");
    let (sink, source) = ws::split(socket);
    let report = state.broker.serve(sink, source).await;
    info!(
        "Peer disconnected after {:.1?} ({})",
        report.duration, report.id
    );
}
