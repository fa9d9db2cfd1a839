//! Error taxonomy for the assessment pipeline.
//!
//! The split matters for callers:
//! - `Precondition` and `ConversationEnded` are rejected before any I/O and
//!   must never be retried automatically.
//! - `Upstream` is retry-safe: the user's turn is already persisted and no
//!   partial assistant content was written.
//! - `Store` aborts the dependent operation outright.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid input caught before any I/O (empty message, missing id).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// No conversation exists yet for the submission.
    #[error("no conversation found for submission {0}")]
    MissingConversation(String),

    /// The conversation reached its end; user turns are rejected until reset.
    #[error("conversation for submission {0} has ended")]
    ConversationEnded(String),

    /// A tutor stream is already in flight for this submission.
    #[error("a tutor reply is already streaming for submission {0}")]
    StreamBusy(String),

    /// The completion service failed or returned malformed output. Retryable.
    #[error("completion service error: {0}")]
    Upstream(String),

    /// A store read or write failed; the dependent operation was aborted.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Stored score JSON did not decode into the five expected dimensions.
    #[error("score decode error: {0}")]
    ScoreDecode(String),
}

impl PipelineError {
    /// Whether a caller may safely retry the same call.
    pub fn retryable(&self) -> bool {
        matches!(self, PipelineError::Upstream(_) | PipelineError::Store(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            PipelineError::Precondition(_) => StatusCode::BAD_REQUEST,
            PipelineError::MissingConversation(_) => StatusCode::NOT_FOUND,
            PipelineError::ConversationEnded(_) => StatusCode::CONFLICT,
            PipelineError::StreamBusy(_) => StatusCode::CONFLICT,
            PipelineError::Upstream(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::ScoreDecode(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_string(),
            "retryable": self.retryable(),
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Errors surfaced by the relational-store contracts.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("row not found: {0}")]
    NotFound(String),
}
