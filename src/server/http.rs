//! HTTP routes.
//!
//! One liveness endpoint for load balancers plus the WebSocket upgrade
//! route. Everything else is the session protocol (`ws.rs`).

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::server::ws::{ws_handler, WsServerState};

/// Service name reported by the health endpoint.
pub const SERVICE_NAME: &str = "pincer";

/// Assemble the router: health check on `/` and `/health`, WebSocket
/// upgrade on `/ws`.
pub fn create_router(state: Arc<WsServerState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Liveness check. Not part of the session protocol.
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
