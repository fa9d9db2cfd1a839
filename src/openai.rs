//! Completion-service client for our use-cases.
//!
//! We only call chat.completions, in three shapes: a streamed tutor turn, a
//! plain-text completion (feedback sections), and a strict JSON object
//! completion (structured scoring). Calls are instrumented and log model
//! names, latencies, and response sizes (not contents).
//!
//! NOTE: We never log the API key and we keep payload truncations short to
//! avoid PII leaks.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{info, instrument, warn};

use crate::domain::{EndReason, Role, Turn};

/// One tutor-turn request, carrying the full instruction context.
#[derive(Clone, Debug)]
pub struct TutorTurnRequest {
    pub submission_id: String,
    pub student_id: String,
    pub assignment_id: String,
    pub assignment_instructions: String,
    /// Accumulated turns, oldest first, excluding the message below.
    pub turns: Vec<Turn>,
    pub message: String,
    pub is_initial_greeting: bool,
    pub language: String,
}

/// Terminal payload of a streamed tutor turn.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub content: String,
    pub should_end: bool,
    pub end_reason: Option<EndReason>,
}

/// Opaque text-completion service. Implemented by the OpenAI client and, in
/// tests and keyless deployments, by scripted stand-ins. Errors stay stringly
/// at this wire seam; callers convert them into the pipeline taxonomy.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Stream a tutor turn token by token into `sink`. A closed sink means
    /// the caller went away: stop consuming upstream and return an error so
    /// nothing partial gets persisted.
    async fn stream_tutor_turn(
        &self,
        system: &str,
        req: &TutorTurnRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<TurnOutcome, String>;

    /// Single non-streaming plain-text completion.
    async fn complete_text(&self, system: &str, user: &str) -> Result<String, String>;

    /// Single non-streaming JSON-object completion.
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
    ) -> Result<serde_json::Value, String>;
}

#[derive(Clone)]
pub struct OpenAI {
    client: reqwest::Client,
    api_key: String,
    pub base_url: String,
    pub fast_model: String,
    pub strong_model: String,
}

impl OpenAI {
    /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let fast_model =
            std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        let strong_model =
            std::env::var("OPENAI_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());
        let timeout_secs = std::env::var("OPENAI_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(20);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .ok()?;

        Some(Self { client, api_key, base_url, fast_model, strong_model })
    }

    fn post(&self, body: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        self.client
            .post(url)
            .header(USER_AGENT, "mentora-backend/0.1")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(body)
    }

    #[instrument(level = "info", skip(self, system, user), fields(model = %model))]
    async fn chat_plain(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<String, String> {
        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessageReq { role: "system".into(), content: system.into() },
                ChatMessageReq { role: "user".into(), content: user.into() },
            ],
            temperature,
            stream: false,
            response_format: None,
        };

        let res = self.post(&req).send().await.map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            let msg = extract_openai_error(&body).unwrap_or(body);
            return Err(format!("OpenAI HTTP {}: {}", status, msg));
        }

        let body: ChatCompletionResponse = res.json().await.map_err(|e| e.to_string())?;
        if let Some(usage) = &body.usage {
            info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
        }
        let text = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(text)
    }
}

#[async_trait]
impl CompletionService for OpenAI {
    #[instrument(
        level = "info",
        skip(self, system, req, sink),
        fields(model = %self.fast_model, submission_id = %req.submission_id, history = req.turns.len(), greeting = req.is_initial_greeting)
    )]
    async fn stream_tutor_turn(
        &self,
        system: &str,
        req: &TutorTurnRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<TurnOutcome, String> {
        let mut messages = Vec::with_capacity(req.turns.len() + 2);
        messages.push(ChatMessageReq { role: "system".into(), content: system.into() });
        for t in &req.turns {
            messages.push(ChatMessageReq {
                role: match t.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                },
                content: t.content.clone(),
            });
        }
        messages.push(ChatMessageReq { role: "user".into(), content: req.message.clone() });

        let body = ChatCompletionRequest {
            model: self.fast_model.clone(),
            messages,
            temperature: 0.7,
            stream: true,
            response_format: None,
        };

        let start = std::time::Instant::now();
        let res = self.post(&body).send().await.map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            let msg = extract_openai_error(&text).unwrap_or(text);
            return Err(format!("OpenAI HTTP {}: {}", status, msg));
        }

        // SSE framing: one `data: <json>` line per chunk, `data: [DONE]` last.
        let stream = res.bytes_stream().map(|r| r.map_err(io::Error::other));
        let reader = StreamReader::new(stream);
        let mut lines = BufReader::new(reader).lines();

        let mut content = String::new();
        let mut should_end = false;
        let mut end_reason: Option<EndReason> = None;

        while let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? {
            let Some(data) = line.strip_prefix("data: ") else { continue };
            if data == "[DONE]" {
                break;
            }
            let chunk: StreamChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "Malformed streaming chunk");
                    return Err(format!("malformed streaming chunk: {}", e));
                }
            };

            if let Some(choice) = chunk.choices.first() {
                if let Some(tok) = &choice.delta.content {
                    content.push_str(tok);
                    if sink.send(tok.clone()).await.is_err() {
                        // Caller dropped the stream; abandon upstream too.
                        return Err("token stream cancelled by caller".into());
                    }
                }
                match choice.finish_reason.as_deref() {
                    Some("length") => {
                        should_end = true;
                        end_reason = Some(EndReason::TurnLimit);
                    }
                    Some("content_filter") => {
                        should_end = true;
                        end_reason = Some(EndReason::AiDetected);
                    }
                    _ => {}
                }
            }
            // Server-side policy extension on the terminal chunk.
            if chunk.should_end {
                should_end = true;
            }
            if chunk.end_reason.is_some() {
                end_reason = chunk.end_reason;
            }
        }

        info!(elapsed = ?start.elapsed(), chars = content.len(), should_end, "Tutor turn streamed");
        Ok(TurnOutcome { content, should_end, end_reason })
    }

    #[instrument(level = "info", skip(self, system, user), fields(model = %self.strong_model, user_len = user.len()))]
    async fn complete_text(&self, system: &str, user: &str) -> Result<String, String> {
        self.chat_plain(&self.strong_model, system, user, 0.4).await
    }

    #[instrument(level = "info", skip(self, system, user), fields(model = %self.strong_model, user_len = user.len()))]
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
    ) -> Result<serde_json::Value, String> {
        let req = ChatCompletionRequest {
            model: self.strong_model.clone(),
            messages: vec![
                ChatMessageReq { role: "system".into(), content: system.into() },
                ChatMessageReq { role: "user".into(), content: user.into() },
            ],
            temperature: 0.2,
            stream: false,
            response_format: Some(ResponseFormat { r#type: "json_object".into() }),
        };

        let res = self.post(&req).send().await.map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            let msg = extract_openai_error(&body).unwrap_or(body);
            return Err(format!("OpenAI HTTP {}: {}", status, msg));
        }

        let body: ChatCompletionResponse = res.json().await.map_err(|e| e.to_string())?;
        if let Some(usage) = &body.usage {
            info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
        }
        let text = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        serde_json::from_str(&text).map_err(|e| format!("JSON parse error: {}", e))
    }
}

/// Keyless fallback tutor so the backend stays demoable without OpenAI.
/// Replies are canned; the session closes itself after a few exchanges with
/// the standard completion phrase.
pub struct StubTutor;

#[async_trait]
impl CompletionService for StubTutor {
    async fn stream_tutor_turn(
        &self,
        _system: &str,
        req: &TutorTurnRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<TurnOutcome, String> {
        let user_turns = req.turns.iter().filter(|t| t.role == Role::User).count();
        let reply = if req.is_initial_greeting {
            "Hello! Let's work through this assignment together. What is your first thought?"
        } else if user_turns >= 2 {
            "Good reasoning. You have met the goal of this assignment, so we are done."
        } else {
            "Interesting. Can you say more about why you think that?"
        };
        for word in reply.split_inclusive(' ') {
            if sink.send(word.to_string()).await.is_err() {
                return Err("token stream cancelled by caller".into());
            }
        }
        Ok(TurnOutcome { content: reply.to_string(), should_end: false, end_reason: None })
    }

    async fn complete_text(&self, _system: &str, user: &str) -> Result<String, String> {
        let name = user
            .lines()
            .find_map(|l| l.strip_prefix("Student name: "))
            .unwrap_or("the student");
        Ok(format!(
            "** Feedback for {name} **\nYou engaged thoughtfully with the assignment.\n**End of Feedback**\n\
** Feedback for the teacher **\nStub feedback; no completion service configured.\n**End of Feedback**"
        ))
    }

    async fn complete_json(
        &self,
        _system: &str,
        _user: &str,
    ) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({
            "scores": {"vision": 5, "values": 5, "thinking": 5, "connection": 5, "action": 5},
            "hard_skills": []
        }))
    }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessageReq>,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}
#[derive(Serialize)]
struct ChatMessageReq {
    role: String,
    content: String,
}
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    r#type: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResp,
}
#[derive(Deserialize)]
struct ChatMessageResp {
    content: Option<String>,
}
#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
}

/// One streamed chunk. `should_end`/`end_reason` are the gateway's policy
/// extension on the terminal chunk; plain OpenAI never sets them.
#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default, rename = "shouldEnd")]
    should_end: bool,
    #[serde(default, rename = "endReason")]
    end_reason: Option<EndReason>,
}
#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}
#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct EWrap {
        error: EObj,
    }
    #[derive(Deserialize)]
    struct EObj {
        message: String,
    }
    serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}
