//! HTTP endpoint handlers. These are thin wrappers that forward to the
//! pipeline components. The conversation endpoints here buffer the tutor
//! reply instead of streaming it; streaming clients use the WebSocket.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use tokio::sync::mpsc;
use tracing::{info, instrument};

use crate::aggregate::ScopeFilter;
use crate::error::PipelineError;
use crate::protocol::*;
use crate::state::AppState;

/// Token sink that discards streamed fragments; the buffered reply comes
/// back in the call result.
fn drain_sink() -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    tx
}

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse {
    Json(HealthOut { ok: true })
}

#[instrument(level = "info", skip(state), fields(%submission_id))]
pub async fn http_post_init(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<Json<SessionOut>, PipelineError> {
    let view = state.orchestrator.initialize(&submission_id, drain_sink()).await?;
    info!(target: "conversation", %submission_id, turns = view.turns.len(), "HTTP init served");
    Ok(Json(SessionOut { turns: view.turns, completed: view.completed }))
}

#[instrument(level = "info", skip(state, body), fields(%submission_id, text_len = body.text.len()))]
pub async fn http_post_message(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
    Json(body): Json<MessageIn>,
) -> Result<Json<MessageOut>, PipelineError> {
    let result = state
        .orchestrator
        .send_message(&submission_id, &body.text, drain_sink())
        .await?;
    info!(target: "conversation", %submission_id, completed = result.completed, "HTTP message served");
    Ok(Json(MessageOut {
        reply: result.assistant.content,
        completed: result.completed,
        end_reason: result.end_reason,
    }))
}

#[instrument(level = "info", skip(state), fields(%submission_id))]
pub async fn http_post_reset(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<Json<HealthOut>, PipelineError> {
    state.orchestrator.reset(&submission_id).await?;
    Ok(Json(HealthOut { ok: true }))
}

#[instrument(level = "info", skip(state), fields(%submission_id))]
pub async fn http_post_feedback(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<Json<FeedbackOut>, PipelineError> {
    let outcome = state.feedback.generate(&submission_id).await?;
    info!(target: "feedback", %submission_id, "HTTP feedback generated");
    Ok(Json(FeedbackOut {
        submission_id,
        student_feedback: outcome.feedback.student_feedback,
        teacher_feedback: outcome.feedback.teacher_feedback,
    }))
}

#[instrument(level = "info", skip(state), fields(%classroom_id))]
pub async fn http_get_classroom_analytics(
    State(state): State<Arc<AppState>>,
    Path(classroom_id): Path<String>,
) -> Result<impl IntoResponse, PipelineError> {
    let analytics = state.analytics.classroom_analytics(&classroom_id).await?;
    info!(target: "analytics", %classroom_id, students = analytics.student_count, partial = analytics.partial, "HTTP classroom analytics served");
    Ok(Json(analytics))
}

#[instrument(level = "info", skip(state), fields(%classroom_id, %assignment_id))]
pub async fn http_get_assignment_skills(
    State(state): State<Arc<AppState>>,
    Path((classroom_id, assignment_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, PipelineError> {
    let grouped = state.analytics.assignment_skills(&classroom_id, &assignment_id).await?;
    info!(target: "analytics", %classroom_id, %assignment_id, students = grouped.len(), "HTTP assignment skills served");
    Ok(Json(grouped))
}

#[instrument(level = "info", skip(state, q), fields(%classroom_id, student = ?q.student, assignment = ?q.assignment))]
pub async fn http_get_aggregate(
    State(state): State<Arc<AppState>>,
    Path(classroom_id): Path<String>,
    Query(q): Query<AggregateQuery>,
) -> Result<impl IntoResponse, PipelineError> {
    let student = ScopeFilter::parse(q.student.as_deref());
    let assignment = ScopeFilter::parse(q.assignment.as_deref());
    let view = state.analytics.aggregate(&classroom_id, &student, &assignment).await?;
    info!(target: "analytics", %classroom_id, snapshots = view.snapshot_count, "HTTP aggregate served");
    Ok(Json(view))
}
