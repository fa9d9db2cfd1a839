//! WebSocket upgrade + message loop. `init` and `send_message` stream token
//! frames as they arrive from the tutor, then a terminal frame; the other
//! messages get a single JSON reply.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use crate::error::PipelineError;
use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::state::AppState;
use crate::store::ConversationStore;

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!(target: "mentora_backend", "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

fn encode(msg: &ServerWsMessage) -> String {
    serde_json::to_string(msg).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e), "retryable": false })
            .to_string()
    })
}

async fn send(socket: &mut WebSocket, msg: &ServerWsMessage) -> bool {
    if let Err(e) = socket.send(Message::Text(encode(msg))).await {
        error!(target: "mentora_backend", error = %e, "WS send error");
        return false;
    }
    true
}

/// Drain streamed tokens into the socket while the orchestrator call runs in
/// a separate task. The channel closing (sender dropped at call end) ends
/// the drain; a dead socket drops the receiver, which cancels the upstream
/// stream through the sink contract.
async fn pump_tokens(
    socket: &mut WebSocket,
    mut rx: mpsc::Receiver<String>,
) -> bool {
    while let Some(tok) = rx.recv().await {
        if !send(socket, &ServerWsMessage::Token { text: tok }).await {
            return false;
        }
    }
    true
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
    info!(target: "mentora_backend", "WebSocket connected");
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(txt) => {
                let incoming = match serde_json::from_str::<ClientWsMessage>(&txt) {
                    Ok(m) => m,
                    Err(e) => {
                        let reply = ServerWsMessage::Error {
                            message: format!("Invalid JSON: {}", e),
                            retryable: false,
                        };
                        if !send(&mut socket, &reply).await {
                            break;
                        }
                        continue;
                    }
                };
                debug!(target: "mentora_backend", "WS received: {:?}", &incoming);
                if !handle_client_ws(incoming, &state, &mut socket).await {
                    break;
                }
            }
            Message::Ping(payload) => {
                let _ = socket.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    info!(target: "mentora_backend", "WebSocket disconnected");
}

/// Dispatch one client message. Returns false when the socket went away.
async fn handle_client_ws(msg: ClientWsMessage, state: &AppState, socket: &mut WebSocket) -> bool {
    match msg {
        ClientWsMessage::Ping => send(socket, &ServerWsMessage::Pong).await,

        ClientWsMessage::Init { submission_id } => {
            let (tx, rx) = mpsc::channel::<String>(64);
            let orch = state.orchestrator.clone();
            let sid = submission_id.clone();
            let job = tokio::spawn(async move { orch.initialize(&sid, tx).await });

            if !pump_tokens(socket, rx).await {
                let _ = job.await;
                return false;
            }
            let result = job
                .await
                .unwrap_or_else(|e| Err(PipelineError::Upstream(format!("task failed: {}", e))));
            match result {
                Ok(view) => {
                    info!(target: "conversation", %submission_id, turns = view.turns.len(), completed = view.completed, "WS init served");
                    send(
                        socket,
                        &ServerWsMessage::Session { turns: view.turns, completed: view.completed },
                    )
                    .await
                }
                Err(e) => send(socket, &ServerWsMessage::from_error(&e)).await,
            }
        }

        ClientWsMessage::SendMessage { submission_id, text } => {
            let (tx, rx) = mpsc::channel::<String>(64);
            let orch = state.orchestrator.clone();
            let sid = submission_id.clone();
            let job = tokio::spawn(async move { orch.send_message(&sid, &text, tx).await });

            if !pump_tokens(socket, rx).await {
                let _ = job.await;
                return false;
            }
            let result = job
                .await
                .unwrap_or_else(|e| Err(PipelineError::Upstream(format!("task failed: {}", e))));
            match result {
                Ok(turn) => {
                    info!(target: "conversation", %submission_id, completed = turn.completed, "WS turn served");
                    send(
                        socket,
                        &ServerWsMessage::TurnComplete {
                            should_end: turn.completed,
                            end_reason: turn.end_reason,
                        },
                    )
                    .await
                }
                Err(e) => send(socket, &ServerWsMessage::from_error(&e)).await,
            }
        }

        ClientWsMessage::Finish { submission_id } => {
            match state.feedback.generate(&submission_id).await {
                Ok(outcome) => {
                    info!(target: "feedback", %submission_id, "WS feedback generated");
                    send(
                        socket,
                        &ServerWsMessage::FeedbackReady {
                            student_feedback: outcome.feedback.student_feedback,
                            teacher_feedback: outcome.feedback.teacher_feedback,
                        },
                    )
                    .await
                }
                Err(e) => send(socket, &ServerWsMessage::from_error(&e)).await,
            }
        }

        ClientWsMessage::Reset { submission_id } => {
            match state.orchestrator.reset(&submission_id).await {
                Ok(()) => {
                    let turns = state
                        .store
                        .load_conversation(&submission_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|c| c.turns)
                        .unwrap_or_default();
                    send(socket, &ServerWsMessage::Session { turns, completed: false }).await
                }
                Err(e) => send(socket, &ServerWsMessage::from_error(&e)).await,
            }
        }
    }
}
