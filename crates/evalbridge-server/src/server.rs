//! HTTP server implementation using Axum.

use crate::handler::{handle_eval, handle_health, handle_ws};
use axum::{
    routing::{get, post},
    Router,
};
use evalbridge_core::{Broker, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    /// Broker owning the active peer session
    pub broker: Arc<Broker>,
    /// Deadline applied to each `/eval` request
    pub eval_timeout: Duration,
}

/// Build the router serving `/health`, `/eval` and `/ws`.
pub fn router(state: Arc<AppState>) -> Router {
    // The peer page may be served from any origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(ServerConfig::HEALTH_PATH, get(handle_health))
        .route(ServerConfig::EVAL_PATH, post(handle_eval))
        .route(ServerConfig::WS_PATH, get(handle_ws))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    broker: Arc<Broker>,
    eval_timeout: Duration,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = router(Arc::new(AppState {
        broker,
        eval_timeout,
    }));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
