//! Per-submission turn-taking state machine.
//!
//! The orchestrator owns the conversation lifecycle: load-or-initialize,
//! streamed tutor turns, and completion detection. Persistence ordering is
//! the contract that matters here:
//!   - the user turn is persisted before the model is called;
//!   - a failed stream discards the partial assistant text and persists
//!     nothing new, leaving the user turn intact for a retry;
//!   - the finished assistant turn is persisted before detection runs.
//!
//! Concurrency: one logical owner per submission is assumed (the open client
//! session). Within this process a per-submission advisory lock rejects a
//! second concurrent stream outright rather than interleaving tokens.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::classify::CompletionClassifier;
use crate::config::Prompts;
use crate::domain::{Conversation, EndReason, Submission, SubmissionStatus, Turn};
use crate::error::PipelineError;
use crate::openai::{CompletionService, TutorTurnRequest};
use crate::store::{AssessmentStore, ConversationStore};
use crate::util::{detect_language, fill_template};

/// Lifecycle of one submission's conversation within this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    AwaitingUserTurn,
    StreamingTutorTurn,
    Completed,
}

struct SessionSlot {
    /// Held across the whole streamed turn; `try_lock` failure means a
    /// stream is already in flight for this submission.
    stream_guard: Mutex<()>,
    phase: RwLock<Phase>,
}

impl SessionSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stream_guard: Mutex::new(()),
            phase: RwLock::new(Phase::Uninitialized),
        })
    }
}

/// Replayed state handed back on initialize.
#[derive(Clone, Debug)]
pub struct SessionView {
    pub turns: Vec<Turn>,
    pub completed: bool,
}

/// Result of one finished tutor turn.
#[derive(Clone, Debug)]
pub struct TurnResult {
    pub assistant: Turn,
    pub completed: bool,
    pub end_reason: Option<EndReason>,
}

pub struct ConversationOrchestrator {
    conversations: Arc<dyn ConversationStore>,
    records: Arc<dyn AssessmentStore>,
    completion: Arc<dyn CompletionService>,
    classifier: Arc<dyn CompletionClassifier>,
    prompts: Prompts,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl ConversationOrchestrator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        records: Arc<dyn AssessmentStore>,
        completion: Arc<dyn CompletionService>,
        classifier: Arc<dyn CompletionClassifier>,
        prompts: Prompts,
    ) -> Self {
        Self {
            conversations,
            records,
            completion,
            classifier,
            prompts,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, submission_id: &str) -> Arc<SessionSlot> {
        if let Some(slot) = self.sessions.read().await.get(submission_id) {
            return slot.clone();
        }
        self.sessions
            .write()
            .await
            .entry(submission_id.to_string())
            .or_insert_with(SessionSlot::new)
            .clone()
    }

    /// Current in-process phase (test and diagnostics helper).
    #[allow(dead_code)]
    pub async fn phase(&self, submission_id: &str) -> Phase {
        match self.sessions.read().await.get(submission_id) {
            Some(slot) => *slot.phase.read().await,
            None => Phase::Uninitialized,
        }
    }

    async fn load_submission(&self, submission_id: &str) -> Result<Submission, PipelineError> {
        if submission_id.trim().is_empty() {
            return Err(PipelineError::Precondition("missing submission id".into()));
        }
        self.records
            .submission(submission_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Precondition(format!("unknown submission {}", submission_id))
            })
    }

    /// (system prompt, raw assignment instructions) for one tutor turn.
    async fn tutor_context(&self, submission: &Submission, language: &str) -> (String, String) {
        let instructions = match self.records.assignment(&submission.assignment_id).await {
            Ok(Some(a)) => a.instructions,
            _ => String::new(),
        };
        let system = fill_template(
            &self.prompts.tutor_system,
            &[("instructions", instructions.as_str()), ("language", language)],
        );
        (system, instructions)
    }

    /// Load-or-initialize. An existing conversation with messages is replayed
    /// and the last assistant turn re-inspected so `Completed` survives a
    /// reload without a persisted "ended" flag. A fresh submission gets a
    /// synthetic greeting instruction and the tutor's opening streamed into
    /// `sink`. Repeated calls never create a second conversation.
    #[instrument(level = "info", skip(self, sink), fields(%submission_id))]
    pub async fn initialize(
        &self,
        submission_id: &str,
        sink: mpsc::Sender<String>,
    ) -> Result<SessionView, PipelineError> {
        let submission = self.load_submission(submission_id).await?;
        let slot = self.slot(submission_id).await;
        let _guard = slot
            .stream_guard
            .try_lock()
            .map_err(|_| PipelineError::StreamBusy(submission_id.to_string()))?;
        *slot.phase.write().await = Phase::Initializing;

        // Read-before-write: never blind-insert a second conversation.
        if let Some(conv) = self.conversations.load_conversation(submission_id).await? {
            if !conv.turns.is_empty() {
                let completed = submission.status == SubmissionStatus::Completed
                    || conv
                        .last_assistant_turn()
                        .is_some_and(|t| self.classifier.is_complete(&t.content));
                *slot.phase.write().await =
                    if completed { Phase::Completed } else { Phase::AwaitingUserTurn };
                info!(target: "conversation", %submission_id, turns = conv.turns.len(), completed, "Replayed existing conversation");
                return Ok(SessionView { turns: conv.turns, completed });
            }
        }

        // Fresh conversation: stream the greeting before persisting anything,
        // so a failed greeting leaves no half-initialized row behind.
        let (system, instructions) = self.tutor_context(&submission, "en").await;
        let req = TutorTurnRequest {
            submission_id: submission.id.clone(),
            student_id: submission.student_id.clone(),
            assignment_id: submission.assignment_id.clone(),
            assignment_instructions: instructions,
            turns: Vec::new(),
            message: self.prompts.greeting_instruction.clone(),
            is_initial_greeting: true,
            language: "en".into(),
        };
        let outcome = match self.completion.stream_tutor_turn(&system, &req, sink).await {
            Ok(o) => o,
            Err(e) => {
                *slot.phase.write().await = Phase::Uninitialized;
                warn!(target: "conversation", %submission_id, error = %e, "Greeting stream failed");
                return Err(PipelineError::Upstream(e));
            }
        };

        let mut conv = Conversation::new(submission_id);
        conv.turns.push(Turn::assistant(outcome.content.clone()));
        self.conversations.save_conversation(&conv).await?;

        let completed = outcome.should_end || self.classifier.is_complete(&outcome.content);
        *slot.phase.write().await =
            if completed { Phase::Completed } else { Phase::AwaitingUserTurn };
        info!(target: "conversation", %submission_id, completed, "Conversation initialized with greeting");
        Ok(SessionView { turns: conv.turns, completed })
    }

    /// One user turn: persist it, stream the tutor reply into `sink`, persist
    /// the finished reply, then run completion detection. A server-declared
    /// end in the stream's terminal payload counts the same as a local phrase
    /// match.
    #[instrument(level = "info", skip(self, content, sink), fields(%submission_id, content_len = content.len()))]
    pub async fn send_message(
        &self,
        submission_id: &str,
        content: &str,
        sink: mpsc::Sender<String>,
    ) -> Result<TurnResult, PipelineError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PipelineError::Precondition("message must not be empty".into()));
        }
        let submission = self.load_submission(submission_id).await?;

        let slot = self.slot(submission_id).await;
        let phase_now = *slot.phase.read().await;
        if phase_now == Phase::Completed || submission.status == SubmissionStatus::Completed {
            return Err(PipelineError::ConversationEnded(submission_id.to_string()));
        }
        let _guard = slot
            .stream_guard
            .try_lock()
            .map_err(|_| PipelineError::StreamBusy(submission_id.to_string()))?;

        let mut conv = self
            .conversations
            .load_conversation(submission_id)
            .await?
            .filter(|c| !c.turns.is_empty())
            .ok_or_else(|| PipelineError::MissingConversation(submission_id.to_string()))?;

        // Recover a completed conversation after a process restart, where the
        // session map is cold. A session explicitly reset stays resettable:
        // its phase is no longer Uninitialized, so this check is skipped.
        if phase_now == Phase::Uninitialized
            && conv
                .last_assistant_turn()
                .is_some_and(|t| self.classifier.is_complete(&t.content))
        {
            *slot.phase.write().await = Phase::Completed;
            return Err(PipelineError::ConversationEnded(submission_id.to_string()));
        }

        // Persist the user turn first; never call the model for an
        // unpersisted turn.
        conv.turns.push(Turn::user(content));
        self.conversations.save_conversation(&conv).await?;

        *slot.phase.write().await = Phase::StreamingTutorTurn;
        let language = detect_language(content);
        let (system, instructions) = self.tutor_context(&submission, language).await;
        let history = conv.turns[..conv.turns.len() - 1].to_vec();
        let req = TutorTurnRequest {
            submission_id: submission.id.clone(),
            student_id: submission.student_id.clone(),
            assignment_id: submission.assignment_id.clone(),
            assignment_instructions: instructions,
            turns: history,
            message: content.to_string(),
            is_initial_greeting: false,
            language: language.into(),
        };

        let outcome = match self.completion.stream_tutor_turn(&system, &req, sink).await {
            Ok(o) => o,
            Err(e) => {
                // Discard the partial assistant text; the user turn stays
                // persisted so a retry does not resend it.
                *slot.phase.write().await = Phase::AwaitingUserTurn;
                warn!(target: "conversation", %submission_id, error = %e, "Tutor stream failed mid-turn");
                return Err(PipelineError::Upstream(e));
            }
        };

        let assistant = Turn::assistant(outcome.content.clone());
        conv.turns.push(assistant.clone());
        self.conversations.save_conversation(&conv).await?;

        let completed = outcome.should_end || self.classifier.is_complete(&outcome.content);
        *slot.phase.write().await =
            if completed { Phase::Completed } else { Phase::AwaitingUserTurn };
        if completed {
            info!(target: "conversation", %submission_id, end_reason = ?outcome.end_reason, "Completion detected");
        }
        Ok(TurnResult { assistant, completed, end_reason: outcome.end_reason })
    }

    /// External reset out of `Completed`. Leaves the transcript untouched;
    /// the session accepts user turns again until the next detection.
    #[instrument(level = "info", skip(self), fields(%submission_id))]
    pub async fn reset(&self, submission_id: &str) -> Result<(), PipelineError> {
        let submission = self.load_submission(submission_id).await?;
        if submission.status == SubmissionStatus::Completed {
            self.records
                .set_submission_status(submission_id, SubmissionStatus::InProgress)
                .await?;
        }
        let slot = self.slot(submission_id).await;
        *slot.phase.write().await = Phase::AwaitingUserTurn;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use crate::classify::PhraseMarkerClassifier;
    use crate::domain::{Assignment, StudentProfile};
    use crate::store::MemoryStore;

    /// One scripted tutor turn: tokens pushed into the sink, then either a
    /// finished outcome or a mid-stream failure.
    enum Script {
        Reply { tokens: Vec<&'static str>, should_end: bool, end_reason: Option<EndReason> },
        FailAfter(Vec<&'static str>),
    }

    struct ScriptedService {
        scripts: StdMutex<VecDeque<Script>>,
    }

    impl ScriptedService {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self { scripts: StdMutex::new(scripts.into()) })
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedService {
        async fn stream_tutor_turn(
            &self,
            _system: &str,
            _req: &TutorTurnRequest,
            sink: mpsc::Sender<String>,
        ) -> Result<crate::openai::TurnOutcome, String> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted service exhausted");
            match script {
                Script::Reply { tokens, should_end, end_reason } => {
                    let mut content = String::new();
                    for t in tokens {
                        content.push_str(t);
                        let _ = sink.send(t.to_string()).await;
                    }
                    Ok(crate::openai::TurnOutcome { content, should_end, end_reason })
                }
                Script::FailAfter(tokens) => {
                    for t in tokens {
                        let _ = sink.send(t.to_string()).await;
                    }
                    Err("upstream connection reset".into())
                }
            }
        }

        async fn complete_text(&self, _s: &str, _u: &str) -> Result<String, String> {
            unreachable!("orchestrator never calls non-streaming completions")
        }

        async fn complete_json(&self, _s: &str, _u: &str) -> Result<serde_json::Value, String> {
            unreachable!("orchestrator never calls non-streaming completions")
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store
            .upsert_student(StudentProfile {
                id: "stu-1".into(),
                full_name: "Ada Moreno".into(),
                classroom_id: "class-1".into(),
            })
            .await;
        store
            .upsert_assignment(Assignment {
                id: "asg-1".into(),
                classroom_id: "class-1".into(),
                title: "Photosynthesis".into(),
                instructions: "Discuss how plants convert light to energy.".into(),
            })
            .await;
        store
            .upsert_submission(Submission {
                id: "sub-1".into(),
                student_id: "stu-1".into(),
                assignment_id: "asg-1".into(),
                classroom_id: "class-1".into(),
                status: SubmissionStatus::InProgress,
            })
            .await;
        store
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        service: Arc<dyn CompletionService>,
    ) -> ConversationOrchestrator {
        ConversationOrchestrator::new(
            store.clone(),
            store,
            service,
            Arc::new(PhraseMarkerClassifier::new()),
            Prompts::default(),
        )
    }

    fn drain() -> mpsc::Sender<String> {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        tx
    }

    #[tokio::test]
    async fn repeated_initialize_creates_one_conversation() {
        let store = seeded_store().await;
        let service = ScriptedService::new(vec![Script::Reply {
            tokens: vec!["Hello ", "there!"],
            should_end: false,
            end_reason: None,
        }]);
        let orch = orchestrator(store.clone(), service);

        let first = orch.initialize("sub-1", drain()).await.unwrap();
        assert_eq!(first.turns.len(), 1);
        assert!(!first.completed);

        // Second call replays; the scripted service would panic if called again.
        let second = orch.initialize("sub-1", drain()).await.unwrap();
        assert_eq!(second.turns.len(), 1);
        assert_eq!(store.conversation_count().await, 1);
    }

    #[tokio::test]
    async fn greeting_tokens_reach_the_sink() {
        let store = seeded_store().await;
        let service = ScriptedService::new(vec![Script::Reply {
            tokens: vec!["Wel", "come!"],
            should_end: false,
            end_reason: None,
        }]);
        let orch = orchestrator(store, service);

        let (tx, mut rx) = mpsc::channel(8);
        let view = orch.initialize("sub-1", tx).await.unwrap();
        assert_eq!(view.turns[0].content, "Welcome!");
        assert_eq!(rx.recv().await.as_deref(), Some("Wel"));
        assert_eq!(rx.recv().await.as_deref(), Some("come!"));
    }

    #[tokio::test]
    async fn end_to_end_turns_then_completion_blocks_until_reset() {
        let store = seeded_store().await;
        let service = ScriptedService::new(vec![
            Script::Reply { tokens: vec!["Hi! What do you think?"], should_end: false, end_reason: None },
            Script::Reply { tokens: vec!["Tell me more."], should_end: false, end_reason: None },
            Script::Reply {
                tokens: vec!["Great insight. ", "We are done."],
                should_end: false,
                end_reason: None,
            },
            Script::Reply { tokens: vec!["Back again?"], should_end: false, end_reason: None },
        ]);
        let orch = orchestrator(store.clone(), service);

        orch.initialize("sub-1", drain()).await.unwrap();

        let r1 = orch.send_message("sub-1", "I think x", drain()).await.unwrap();
        assert!(!r1.completed);
        let conv = store.load_conversation("sub-1").await.unwrap().unwrap();
        assert_eq!(conv.turns.len(), 3); // greeting + user + assistant

        let r2 = orch.send_message("sub-1", "Because of y", drain()).await.unwrap();
        assert!(r2.completed);

        let err = orch.send_message("sub-1", "one more thing", drain()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConversationEnded(_)));

        orch.reset("sub-1").await.unwrap();
        let r3 = orch.send_message("sub-1", "hello again", drain()).await.unwrap();
        assert!(!r3.completed);
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_user_turn_and_no_assistant_turn() {
        let store = seeded_store().await;
        let service = ScriptedService::new(vec![
            Script::Reply { tokens: vec!["Hi!"], should_end: false, end_reason: None },
            Script::FailAfter(vec!["par", "tial "]),
        ]);
        let orch = orchestrator(store.clone(), service);

        orch.initialize("sub-1", drain()).await.unwrap();
        let err = orch.send_message("sub-1", "my answer", drain()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Upstream(_)));
        assert!(err.retryable());

        let conv = store.load_conversation("sub-1").await.unwrap().unwrap();
        assert_eq!(conv.turns.len(), 2); // greeting + persisted user turn
        assert_eq!(conv.turns[1].role, crate::domain::Role::User);
        assert_eq!(orch.phase("sub-1").await, Phase::AwaitingUserTurn);
    }

    #[tokio::test]
    async fn server_declared_end_reason_completes_like_a_phrase_match() {
        let store = seeded_store().await;
        let service = ScriptedService::new(vec![
            Script::Reply { tokens: vec!["Hi!"], should_end: false, end_reason: None },
            Script::Reply {
                tokens: vec!["Let's pause here."],
                should_end: true,
                end_reason: Some(EndReason::TurnLimit),
            },
        ]);
        let orch = orchestrator(store, service);

        orch.initialize("sub-1", drain()).await.unwrap();
        let r = orch.send_message("sub-1", "ok", drain()).await.unwrap();
        assert!(r.completed);
        assert_eq!(r.end_reason, Some(EndReason::TurnLimit));
        assert_eq!(orch.phase("sub-1").await, Phase::Completed);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_any_io() {
        let store = seeded_store().await;
        let service = ScriptedService::new(vec![Script::Reply {
            tokens: vec!["Hi!"],
            should_end: false,
            end_reason: None,
        }]);
        let orch = orchestrator(store.clone(), service);
        orch.initialize("sub-1", drain()).await.unwrap();

        let err = orch.send_message("sub-1", "   \n ", drain()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
        let conv = store.load_conversation("sub-1").await.unwrap().unwrap();
        assert_eq!(conv.turns.len(), 1);
    }

    #[tokio::test]
    async fn send_before_initialize_is_missing_conversation() {
        let store = seeded_store().await;
        let service = ScriptedService::new(vec![]);
        let orch = orchestrator(store, service);
        let err = orch.send_message("sub-1", "hello", drain()).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingConversation(_)));
    }

    #[tokio::test]
    async fn completed_transcript_is_recovered_by_a_cold_session() {
        let store = seeded_store().await;
        let service = ScriptedService::new(vec![Script::Reply {
            tokens: vec!["Nice work, we are done."],
            should_end: false,
            end_reason: None,
        }]);
        let orch = orchestrator(store.clone(), service);
        orch.initialize("sub-1", drain()).await.unwrap();

        // A fresh orchestrator (new process) sees the marker in the stored
        // transcript and refuses further turns.
        let cold = orchestrator(store, ScriptedService::new(vec![]));
        let err = cold.send_message("sub-1", "more", drain()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConversationEnded(_)));

        let replay = cold.initialize("sub-1", drain()).await.unwrap();
        assert!(replay.completed);
    }
}
