//! Loading agent configuration (tutor + feedback prompts) from TOML.
//!
//! See `AgentConfig` and `Prompts` for expected schema.

use serde::Deserialize;
use tracing::{error, info};

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub prompts: Prompts,
}

/// Prompts used by the completion-service client. Defaults are sensible for
/// the dialogue tutor and the scoring rubric. Override them in TOML if you
/// need to tune tone or structure.
#[derive(Clone, Debug, Deserialize)]
pub struct Prompts {
    // Tutor conversation
    pub tutor_system: String,
    pub greeting_instruction: String,
    // Feedback generation (free-text sections)
    pub feedback_system: String,
    pub feedback_user_template: String,
    // Structured scoring (JSON object)
    pub scoring_system: String,
    pub scoring_user_template: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            tutor_system: "You are a patient tutor guiding a student through an assignment. \
Assignment instructions:\n{instructions}\n\nReply in language '{language}'. Ask one probing \
question at a time and never give away full answers. When the student has demonstrated the \
assignment's learning goal, say so explicitly and close with the phrase 'we are done'."
                .into(),
            greeting_instruction: "Greet the student warmly, restate the assignment goal in one \
sentence, and ask an opening question. Do not end the conversation yet."
                .into(),
            feedback_system: "You are an experienced educator writing assessment feedback from a \
tutoring transcript. Score against this rubric: clarity of reasoning, depth of reflection, use \
of evidence, openness to revision. Write two sections with EXACTLY these delimiters:\n\
** Feedback for {student_name} **\n<2-3 encouraging paragraphs addressed to the student>\n\
**End of Feedback**\n** Feedback for the teacher **\n<1 paragraph of private notes on gaps and \
next steps>\n**End of Feedback**"
                .into(),
            feedback_user_template: "Student name: {student_name}\nTranscript:\n{transcript}".into(),
            scoring_system: "You grade a tutoring transcript. Respond ONLY with strict JSON: \
{\"scores\": {\"vision\": n, \"values\": n, \"thinking\": n, \"connection\": n, \"action\": n}, \
\"hard_skills\": [{\"domain\": s, \"skill_component\": s, \"current_level_percent\": n, \
\"proficiency_description\": s, \"actionable_challenge\": s}]}. Dimension scores are 0-10, \
levels are 0-100."
                .into(),
            scoring_user_template: "Assignment: {assignment_title}\nTranscript:\n{transcript}".into(),
        }
    }
}

/// Attempt to load `AgentConfig` from AGENT_CONFIG_PATH. On any parsing/IO
/// error, returns None and the built-in defaults are used.
pub fn load_agent_config_from_env() -> Option<AgentConfig> {
    let path = std::env::var("AGENT_CONFIG_PATH").ok()?;
    match std::fs::read_to_string(&path) {
        Ok(s) => match toml::from_str::<AgentConfig>(&s) {
            Ok(cfg) => {
                info!(target: "mentora_backend", %path, "Loaded agent config (TOML)");
                Some(cfg)
            }
            Err(e) => {
                error!(target: "mentora_backend", %path, error = %e, "Failed to parse TOML config");
                None
            }
        },
        Err(e) => {
            error!(target: "mentora_backend", %path, error = %e, "Failed to read TOML config file");
            None
        }
    }
}
