//! Application state: stores, prompts, completion service, and the three
//! pipeline components wired together.
//!
//! This module owns:
//!   - the in-memory relational store (conversation + assessment tables)
//!   - the prompts struct (from TOML or defaults)
//!   - the completion-service client (OpenAI when a key is present,
//!     otherwise the keyless stub so the backend stays demoable)
//!   - the orchestrator, feedback generator, and aggregation engine

use std::sync::Arc;

use tracing::{info, instrument};

use crate::aggregate::ScoreAggregationEngine;
use crate::classify::PhraseMarkerClassifier;
use crate::config::{load_agent_config_from_env, Prompts};
use crate::domain::MissingDimensionPolicy;
use crate::feedback::FeedbackGenerator;
use crate::openai::{CompletionService, OpenAI, StubTutor};
use crate::orchestrator::ConversationOrchestrator;
use crate::seeds::seed_demo_classroom;
use crate::store::MemoryStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub feedback: Arc<FeedbackGenerator>,
    pub analytics: Arc<ScoreAggregationEngine>,
    pub prompts: Prompts,
}

impl AppState {
    /// Build state from env: load config, init the completion service, seed
    /// the demo classroom, wire the pipeline components.
    #[instrument(level = "info", skip_all)]
    pub async fn new() -> Self {
        let cfg_opt = load_agent_config_from_env();
        let prompts = cfg_opt.map(|c| c.prompts).unwrap_or_default();

        let completion: Arc<dyn CompletionService> = match OpenAI::from_env() {
            Some(oa) => {
                info!(target: "mentora_backend", base_url = %oa.base_url, fast_model = %oa.fast_model, strong_model = %oa.strong_model, "OpenAI enabled.");
                Arc::new(oa)
            }
            None => {
                info!(target: "mentora_backend", "OpenAI disabled (no OPENAI_API_KEY). Using stub tutor.");
                Arc::new(StubTutor)
            }
        };

        let store = MemoryStore::new();
        seed_demo_classroom(&store).await;

        let classifier = Arc::new(PhraseMarkerClassifier::new());
        let orchestrator = Arc::new(ConversationOrchestrator::new(
            store.clone(),
            store.clone(),
            completion.clone(),
            classifier,
            prompts.clone(),
        ));
        let feedback = Arc::new(FeedbackGenerator::new(
            store.clone(),
            store.clone(),
            completion,
            prompts.clone(),
        ));
        let analytics = Arc::new(ScoreAggregationEngine::new(
            store.clone(),
            MissingDimensionPolicy::Zero,
        ));

        Self { store, orchestrator, feedback, analytics, prompts }
    }
}
