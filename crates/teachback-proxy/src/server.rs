use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ProxyError;
use crate::handlers;
use crate::ProxyState;

/// Build the router with both completion routes.
pub fn create_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/api/gemini/teach", post(handlers::teach))
        .route("/api/gemini/chat", post(handlers::chat))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn run_server(addr: SocketAddr, state: ProxyState) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

    info!(
        "API server running on {addr} (provider {})",
        if state.is_configured() {
            "configured"
        } else {
            "missing"
        }
    );

    axum::serve(listener, create_router(Arc::new(state)))
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))
}
