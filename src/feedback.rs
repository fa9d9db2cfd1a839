//! Feedback generation: transcript -> free-text feedback sections plus
//! structured scores, persisted as `assignment_feedback`, a `FiveDSnapshot`,
//! and zero or more `HardSkillAssessment` rows.
//!
//! Generation is a terminal, user-visible step: every failure surfaces as an
//! explicit error. Parsing of the free-text sections, by contrast, degrades
//! gracefully, because a formatting miss by the completion service should not
//! lose a whole assessment.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Prompts;
use crate::domain::{
    AssignmentFeedback, FiveDScores, FiveDSnapshot, HardSkillAssessment, Role, SnapshotSource,
    SubmissionStatus, Turn,
};
use crate::error::PipelineError;
use crate::openai::CompletionService;
use crate::store::{AssessmentStore, ConversationStore};
use crate::util::{fill_template, trunc_for_log};

/// Everything one generation run produced and persisted.
#[derive(Clone, Debug)]
pub struct FeedbackOutcome {
    pub feedback: AssignmentFeedback,
    pub snapshot: FiveDSnapshot,
    pub hard_skills: Vec<HardSkillAssessment>,
}

pub struct FeedbackGenerator {
    conversations: Arc<dyn ConversationStore>,
    records: Arc<dyn AssessmentStore>,
    completion: Arc<dyn CompletionService>,
    prompts: Prompts,
}

impl FeedbackGenerator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        records: Arc<dyn AssessmentStore>,
        completion: Arc<dyn CompletionService>,
        prompts: Prompts,
    ) -> Self {
        Self { conversations, records, completion, prompts }
    }

    /// Run the full generation for one submission. Safe to re-run: rows are
    /// append-only, so a retry after a partial failure writes a fresh set.
    /// Callers are responsible for not invoking it twice concurrently.
    #[instrument(level = "info", skip(self), fields(%submission_id))]
    pub async fn generate(&self, submission_id: &str) -> Result<FeedbackOutcome, PipelineError> {
        let submission = self
            .records
            .submission(submission_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Precondition(format!("unknown submission {}", submission_id))
            })?;

        let conversation = self
            .conversations
            .load_conversation(submission_id)
            .await?
            .filter(|c| !c.turns.is_empty())
            .ok_or_else(|| PipelineError::MissingConversation(submission_id.to_string()))?;

        let student_name = match self.records.student(&submission.student_id).await? {
            Some(p) => p.full_name,
            None => "the student".to_string(),
        };
        let assignment_title = match self.records.assignment(&submission.assignment_id).await? {
            Some(a) => a.title,
            None => String::new(),
        };

        let transcript = render_transcript(&conversation.turns);

        // Free-text feedback sections.
        let system = fill_template(&self.prompts.feedback_system, &[("student_name", &student_name)]);
        let user = fill_template(
            &self.prompts.feedback_user_template,
            &[("student_name", &student_name), ("transcript", &transcript)],
        );
        let raw = self
            .completion
            .complete_text(&system, &user)
            .await
            .map_err(PipelineError::Upstream)?;

        let (student_section, teacher_section) = parse_feedback_sections(&raw);
        let student_feedback = match student_section {
            Some(s) => s,
            None => {
                // Student section marker missing entirely: degrade to the
                // whole response rather than fail the generation.
                warn!(target: "feedback", %submission_id, preview = %trunc_for_log(&raw, 80), "Student section marker absent; using full response");
                raw.trim().to_string()
            }
        };
        if student_feedback.is_empty() {
            return Err(PipelineError::Upstream(
                "completion service returned empty feedback".into(),
            ));
        }

        // Structured scoring.
        let scoring_user = fill_template(
            &self.prompts.scoring_user_template,
            &[("assignment_title", &assignment_title), ("transcript", &transcript)],
        );
        let payload_value = self
            .completion
            .complete_json(&self.prompts.scoring_system, &scoring_user)
            .await
            .map_err(PipelineError::Upstream)?;
        let payload: ScoringPayload = serde_json::from_value(payload_value)
            .map_err(|e| PipelineError::Upstream(format!("scoring payload shape: {}", e)))?;
        let scores = FiveDScores::decode_strict(&payload.scores)
            .map_err(PipelineError::ScoreDecode)?;

        let now = Utc::now();
        let feedback = AssignmentFeedback {
            submission_id: submission.id.clone(),
            student_id: submission.student_id.clone(),
            assignment_id: submission.assignment_id.clone(),
            student_feedback,
            teacher_feedback: teacher_section,
            conversation_context: conversation.turns.clone(),
            created_at: now,
        };
        let snapshot = FiveDSnapshot {
            id: Uuid::new_v4().to_string(),
            user_id: submission.student_id.clone(),
            submission_id: Some(submission.id.clone()),
            assignment_id: Some(submission.assignment_id.clone()),
            classroom_id: Some(submission.classroom_id.clone()),
            source: SnapshotSource::Assignment,
            scores: scores.to_value(),
            created_at: now,
        };
        let hard_skills: Vec<HardSkillAssessment> = payload
            .hard_skills
            .into_iter()
            .map(|s| HardSkillAssessment {
                submission_id: submission.id.clone(),
                assignment_id: submission.assignment_id.clone(),
                student_id: submission.student_id.clone(),
                domain: s.domain,
                skill_component: s.skill_component,
                current_level_percent: s.current_level_percent.clamp(0.0, 100.0),
                proficiency_description: s.proficiency_description,
                actionable_challenge: s.actionable_challenge,
                created_at: now,
            })
            .collect();

        self.records.insert_feedback(feedback.clone()).await?;
        self.records.insert_snapshot(snapshot.clone()).await?;
        self.records.insert_hard_skills(hard_skills.clone()).await?;
        self.records
            .set_submission_status(&submission.id, SubmissionStatus::Completed)
            .await?;

        info!(
            target: "feedback",
            %submission_id,
            teacher_section = feedback.teacher_feedback.is_some(),
            skills = hard_skills.len(),
            "Feedback generated and persisted"
        );
        Ok(FeedbackOutcome { feedback, snapshot, hard_skills })
    }
}

/// Render turns as the alternating transcript lines the rubric prompt expects.
pub fn render_transcript(turns: &[Turn]) -> String {
    let mut out = String::new();
    for t in turns {
        let speaker = match t.role {
            Role::User => "Student",
            Role::Assistant => "Agent",
        };
        out.push_str(speaker);
        out.push_str(": ");
        out.push_str(&t.content);
        out.push('\n');
    }
    out
}

#[derive(Deserialize)]
struct ScoringPayload {
    scores: serde_json::Value,
    #[serde(default)]
    hard_skills: Vec<ScoredSkill>,
}

#[derive(Deserialize)]
struct ScoredSkill {
    domain: String,
    skill_component: String,
    current_level_percent: f64,
    #[serde(default)]
    proficiency_description: String,
    #[serde(default)]
    actionable_challenge: String,
}

const END_MARKER: &str = "**end of feedback**";

/// Extract (student, teacher) sections from the free-text response.
/// Matching is tolerant: case-insensitive, optional space after `**`, and a
/// missing end marker runs the section to the end of the text. The teacher
/// section is optional by contract.
pub fn parse_feedback_sections(text: &str) -> (Option<String>, Option<String>) {
    let lower = text.to_lowercase();
    // to_lowercase can shift byte offsets for a handful of code points; when
    // it does, match and slice on the lowercased copy instead of the original.
    let text = if lower.len() == text.len() { text } else { lower.as_str() };

    let mut student: Option<String> = None;
    let mut teacher: Option<String> = None;

    let mut from = 0usize;
    while let Some(rel) = lower[from..].find("**") {
        let open = from + rel;
        let after_open = open + 2;
        let Some(close_rel) = lower[after_open..].find("**") else { break };
        let close = after_open + close_rel;
        let header = lower[after_open..close].trim();

        if header.starts_with("feedback for") {
            let body_start = close + 2;
            let body_end = lower[body_start..]
                .find(END_MARKER)
                .map(|i| body_start + i)
                .unwrap_or(text.len());
            let body = text[body_start..body_end].trim().to_string();
            if header.contains("teacher") {
                if teacher.is_none() && !body.is_empty() {
                    teacher = Some(body);
                }
            } else if student.is_none() && !body.is_empty() {
                student = Some(body);
            }
            from = body_end;
        } else {
            from = close + 2;
        }
    }

    (student, teacher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::domain::{Assignment, Conversation, StudentProfile, Submission};
    use crate::openai::{TurnOutcome, TutorTurnRequest};
    use crate::store::MemoryStore;

    #[test]
    fn parses_both_sections() {
        let text = "preamble\n** Feedback for Ada Moreno **\nGreat reasoning throughout.\n\
**End of Feedback**\n** Feedback for the teacher **\nAda still conflates cause and effect.\n\
**End of Feedback**";
        let (student, teacher) = parse_feedback_sections(text);
        assert_eq!(student.as_deref(), Some("Great reasoning throughout."));
        assert_eq!(teacher.as_deref(), Some("Ada still conflates cause and effect."));
    }

    #[test]
    fn missing_teacher_marker_yields_none() {
        let text = "** Feedback for Ada **\nSolid work.\n**End of Feedback**";
        let (student, teacher) = parse_feedback_sections(text);
        assert_eq!(student.as_deref(), Some("Solid work."));
        assert!(teacher.is_none());
    }

    #[test]
    fn missing_end_marker_runs_to_end_of_text() {
        let text = "**Feedback for Ada**\nKeep going.";
        let (student, _) = parse_feedback_sections(text);
        assert_eq!(student.as_deref(), Some("Keep going."));
    }

    #[test]
    fn marker_free_text_yields_no_sections() {
        let (student, teacher) = parse_feedback_sections("just plain commentary");
        assert!(student.is_none());
        assert!(teacher.is_none());
    }

    #[test]
    fn transcript_renders_alternating_speaker_lines() {
        let turns = vec![Turn::assistant("Hello"), Turn::user("Hi there")];
        assert_eq!(render_transcript(&turns), "Agent: Hello\nStudent: Hi there\n");
    }

    struct CannedScorer {
        feedback_text: String,
        scoring: serde_json::Value,
    }

    #[async_trait]
    impl CompletionService for CannedScorer {
        async fn stream_tutor_turn(
            &self,
            _s: &str,
            _r: &TutorTurnRequest,
            _sink: mpsc::Sender<String>,
        ) -> Result<TurnOutcome, String> {
            unreachable!("feedback generation never streams")
        }

        async fn complete_text(&self, _s: &str, _u: &str) -> Result<String, String> {
            Ok(self.feedback_text.clone())
        }

        async fn complete_json(&self, _s: &str, _u: &str) -> Result<serde_json::Value, String> {
            Ok(self.scoring.clone())
        }
    }

    async fn seeded() -> Arc<MemoryStore> {
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
                instructions: "Discuss it.".into(),
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
        let mut conv = Conversation::new("sub-1");
        conv.turns.push(Turn::assistant("Hello!"));
        conv.turns.push(Turn::user("Plants use light."));
        store.save_conversation(&conv).await.unwrap();
        store
    }

    fn generator(store: Arc<MemoryStore>, service: Arc<dyn CompletionService>) -> FeedbackGenerator {
        FeedbackGenerator::new(store.clone(), store, service, Prompts::default())
    }

    #[tokio::test]
    async fn generate_persists_feedback_snapshot_and_skills() {
        let store = seeded().await;
        let service = Arc::new(CannedScorer {
            feedback_text: "** Feedback for Ada Moreno **\nWell argued.\n**End of Feedback**\n\
** Feedback for the teacher **\nReview chlorophyll next.\n**End of Feedback**"
                .into(),
            scoring: serde_json::json!({
                "scores": {"vision": 7, "values": 6, "thinking": 8, "connection": 5, "action": 9},
                "hard_skills": [{
                    "domain": "biology",
                    "skill_component": "photosynthesis",
                    "current_level_percent": 130.0,
                    "proficiency_description": "Strong grasp",
                    "actionable_challenge": "Explain the Calvin cycle"
                }]
            }),
        });
        let gen = generator(store.clone(), service);

        let out = gen.generate("sub-1").await.unwrap();
        assert_eq!(out.feedback.student_feedback, "Well argued.");
        assert_eq!(out.feedback.teacher_feedback.as_deref(), Some("Review chlorophyll next."));
        assert_eq!(out.feedback.conversation_context.len(), 2);
        assert_eq!(out.hard_skills.len(), 1);
        assert_eq!(out.hard_skills[0].current_level_percent, 100.0); // clamped

        let sub = store.submission("sub-1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubmissionStatus::Completed);
        let snaps = store.snapshots_in_classroom("class-1").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].assignment_id.as_deref(), Some("asg-1"));
    }

    #[tokio::test]
    async fn absent_student_marker_falls_back_to_whole_response() {
        let store = seeded().await;
        let service = Arc::new(CannedScorer {
            feedback_text: "Plain commentary without any markers at all.".into(),
            scoring: serde_json::json!({
                "scores": {"vision": 5, "values": 5, "thinking": 5, "connection": 5, "action": 5}
            }),
        });
        let gen = generator(store, service);

        let out = gen.generate("sub-1").await.unwrap();
        assert_eq!(out.feedback.student_feedback, "Plain commentary without any markers at all.");
        assert!(out.feedback.teacher_feedback.is_none());
    }

    #[tokio::test]
    async fn malformed_scores_fail_loudly() {
        let store = seeded().await;
        let service = Arc::new(CannedScorer {
            feedback_text: "** Feedback for Ada **\nok\n**End of Feedback**".into(),
            scoring: serde_json::json!({
                "scores": {"vision": "high", "values": 5, "thinking": 5, "connection": 5, "action": 5}
            }),
        });
        let gen = generator(store, service);
        let err = gen.generate("sub-1").await.unwrap_err();
        assert!(matches!(err, PipelineError::ScoreDecode(_)));
    }

    #[tokio::test]
    async fn missing_conversation_is_an_explicit_error() {
        let store = MemoryStore::new();
        store
            .upsert_submission(Submission {
                id: "sub-9".into(),
                student_id: "stu-1".into(),
                assignment_id: "asg-1".into(),
                classroom_id: "class-1".into(),
                status: SubmissionStatus::InProgress,
            })
            .await;
        let service = Arc::new(CannedScorer {
            feedback_text: String::new(),
            scoring: serde_json::json!({}),
        });
        let gen = generator(store, service);
        let err = gen.generate("sub-9").await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingConversation(_)));
    }
}
