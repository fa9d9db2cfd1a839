//! Router assembly: HTTP endpoints, WebSocket upgrade, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSocket at `/ws` (streamed conversation traffic)
/// - REST-ish API under `/api/v1/...`
/// - CORS (allow any origin/method/headers) – adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(ws::ws_upgrade))
        // HTTP API
        .route("/api/v1/health", get(http::http_health))
        .route(
            "/api/v1/conversation/:submission_id/init",
            post(http::http_post_init),
        )
        .route(
            "/api/v1/conversation/:submission_id/message",
            post(http::http_post_message),
        )
        .route(
            "/api/v1/conversation/:submission_id/reset",
            post(http::http_post_reset),
        )
        .route("/api/v1/feedback/:submission_id", post(http::http_post_feedback))
        .route(
            "/api/v1/analytics/classroom/:classroom_id",
            get(http::http_get_classroom_analytics),
        )
        .route(
            "/api/v1/analytics/classroom/:classroom_id/aggregate",
            get(http::http_get_aggregate),
        )
        .route(
            "/api/v1/analytics/classroom/:classroom_id/assignment/:assignment_id/skills",
            get(http::http_get_assignment_skills),
        )
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
