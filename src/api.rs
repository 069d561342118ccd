// =============================================================================
// API Surface — WebSocket subscription endpoint plus health, Axum 0.7
// =============================================================================
//
// The outward REST control surface lives in the outer service; this router
// exposes only what the core owns: the hub's WebSocket feed (with origin
// admission) and a health probe.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header::ORIGIN, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::FutureExt;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::hub::{session, Hub, OriginPolicy};

/// Shared state for the router.
pub struct ApiState {
    pub hub: Arc<Hub>,
    pub origins: OriginPolicy,
}

/// Build the router with CORS and shared state.
pub fn router(state: Arc<ApiState>, allowed_origins: &str) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/ws", get(ws_handler))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &str) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .filter_map(|o| HeaderValue::from_str(o.trim()).ok())
        .filter(|v| !v.is_empty())
        .collect();

    if allowed_origins.contains('*') || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    clients: usize,
    dropped_messages: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        clients: state.hub.client_count(),
        dropped_messages: state.hub.dropped_messages(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// WebSocket upgrade
// =============================================================================

/// Admit by origin, then hand the socket to the hub session workers. A
/// panicking session is contained here; the server keeps serving.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !state.origins.allows(origin) {
        warn!(origin = origin.unwrap_or("<none>"), "websocket rejected by origin policy");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    info!("websocket subscriber connecting");
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        if std::panic::AssertUnwindSafe(session::run_session(socket, hub))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("websocket session panicked — contained at worker boundary");
        }
    })
    .into_response()
}
