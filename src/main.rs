//! Mentora · Assessment Conversation Backend
//!
//! - Axum HTTP + WebSocket API
//! - Streamed AI-tutor dialogue with completion detection
//! - Feedback generation and score aggregation over in-memory stores
//!
//! Important env variables:
//!   PORT                : u16 (default 3000)
//!   OPENAI_API_KEY      : enables OpenAI integration if present
//!   OPENAI_BASE_URL     : default "https://api.openai.com/v1"
//!   OPENAI_FAST_MODEL   : default "gpt-4o-mini" (tutor turns)
//!   OPENAI_STRONG_MODEL : default "gpt-4o" (feedback + scoring)
//!   OPENAI_TIMEOUT_SECS : default 20
//!   AGENT_CONFIG_PATH   : path to TOML config (prompts)
//!   LOG_LEVEL           : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT          : "pretty" (default) or "json"

mod aggregate;
mod classify;
mod config;
mod domain;
mod error;
mod feedback;
mod openai;
mod orchestrator;
mod protocol;
mod routes;
mod seeds;
mod state;
mod store;
mod telemetry;
mod util;

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing();

    // Build shared application state (stores, completion service, prompts).
    let state = Arc::new(AppState::new().await);

    // Build the HTTP router with routes, CORS and tracing layers.
    let app = build_router(state.clone());

    // Read port from env or default to 3000.
    let addr: SocketAddr = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = TcpListener::bind(addr).await?;
    info!(target: "mentora_backend", %addr, "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
