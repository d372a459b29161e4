use axum::{
    extract::State,
    http::StatusCode,
    response::{sse::Sse, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::realtime::{channels::DOMAIN_CHANNELS, session::ClientSession, RealtimeHub};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub realtime: Arc<RealtimeHub>,
}

/// Create the API router
pub fn create_router(realtime: Arc<RealtimeHub>) -> Router {
    let state = AppState { realtime };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/stream", get(stream_events).post(stream_actions))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Long-lived SSE stream of normalized domain events and lifecycle
/// signals. The client disconnecting drops the stream and with it the
/// session.
async fn stream_events(State(state): State<AppState>) -> impl IntoResponse {
    let session = ClientSession::open(&state.realtime);
    Sse::new(session.into_sse_stream())
}

/// Polling fallback for clients that cannot hold a stream open.
async fn stream_actions(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match body.get("action").and_then(Value::as_str) {
        Some("status") => (StatusCode::OK, Json(status_body(&state.realtime))).into_response(),
        _ => (StatusCode::BAD_REQUEST, Json(invalid_action_body())).into_response(),
    }
}

// ===== Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

fn status_body(realtime: &RealtimeHub) -> Value {
    let upstream = realtime.upstream().status();
    json!({
        "status": upstream.state,
        "activeConnections": realtime.idle().active_count(),
        "retryCount": upstream.retry_attempt,
        "channels": DOMAIN_CHANNELS,
        "timestamp": Utc::now().timestamp_millis(),
    })
}

fn invalid_action_body() -> Value {
    json!({
        "error": "Invalid action",
        "validActions": ["status"],
    })
}
