//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};

use crate::domain::{EndReason, Turn};
use crate::error::PipelineError;

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    Init {
        #[serde(rename = "submissionId")]
        submission_id: String,
    },
    SendMessage {
        #[serde(rename = "submissionId")]
        submission_id: String,
        text: String,
    },
    Finish {
        #[serde(rename = "submissionId")]
        submission_id: String,
    },
    Reset {
        #[serde(rename = "submissionId")]
        submission_id: String,
    },
}

/// Messages the server sends back over WebSocket. One `send_message` request
/// produces a sequence: zero or more `Token` frames, then `TurnComplete`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    /// Replayed conversation state after `init`.
    Session {
        turns: Vec<Turn>,
        completed: bool,
    },
    /// One streamed tutor token fragment.
    Token {
        text: String,
    },
    /// Terminal payload of a streamed tutor turn.
    TurnComplete {
        #[serde(rename = "shouldEnd")]
        should_end: bool,
        #[serde(rename = "endReason", skip_serializing_if = "Option::is_none")]
        end_reason: Option<EndReason>,
    },
    FeedbackReady {
        #[serde(rename = "studentFeedback")]
        student_feedback: String,
        #[serde(rename = "teacherFeedback")]
        teacher_feedback: Option<String>,
    },
    Error {
        message: String,
        retryable: bool,
    },
}

impl ServerWsMessage {
    pub fn from_error(e: &PipelineError) -> Self {
        ServerWsMessage::Error { message: e.to_string(), retryable: e.retryable() }
    }
}

//
// HTTP request/response DTOs
//

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct MessageIn {
    pub text: String,
}

#[derive(Serialize)]
pub struct SessionOut {
    pub turns: Vec<Turn>,
    pub completed: bool,
}

#[derive(Serialize)]
pub struct MessageOut {
    pub reply: String,
    pub completed: bool,
    #[serde(rename = "endReason", skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

#[derive(Serialize)]
pub struct FeedbackOut {
    #[serde(rename = "submissionId")]
    pub submission_id: String,
    #[serde(rename = "studentFeedback")]
    pub student_feedback: String,
    #[serde(rename = "teacherFeedback")]
    pub teacher_feedback: Option<String>,
}

/// Query axes for the aggregate view: each is "all" (or absent) or an id.
#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    pub student: Option<String>,
    pub assignment: Option<String>,
}
