//! Domain models for the assessment pipeline: conversation turns, submissions,
//! score snapshots, skill assessments, and persisted feedback rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of one conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Ordered turn log, 1:1 with a submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub submission_id: String,
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(submission_id: impl Into<String>) -> Self {
        Self { submission_id: submission_id.into(), turns: Vec::new() }
    }

    /// Last assistant turn, if any. Used to recover completion state after a
    /// reload without persisting a separate "ended" flag.
    pub fn last_assistant_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    InProgress,
    Completed,
}

/// The unit of work tying one student to one assignment attempt.
/// Transitions to `Completed` only through an explicit completion action,
/// never implicitly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub student_id: String,
    pub assignment_id: String,
    pub classroom_id: String,
    pub status: SubmissionStatus,
}

/// Why the server side forced the end of a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    #[serde(rename = "turnLimit")]
    TurnLimit,
    #[serde(rename = "aiDetected")]
    AiDetected,
}

/// The five fixed soft-skill dimensions, each in [0, 10].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FiveDScores {
    pub vision: f64,
    pub values: f64,
    pub thinking: f64,
    pub connection: f64,
    pub action: f64,
}

/// Fixed, exhaustive dimension keys. Aggregation iterates these and must
/// never silently drop one.
pub const DIMENSIONS: [&str; 5] = ["vision", "values", "thinking", "connection", "action"];

const SCORE_MIN: f64 = 0.0;
const SCORE_MAX: f64 = 10.0;

/// How to treat a dimension key absent from a stored snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MissingDimensionPolicy {
    /// Absent key counts as 0 but the snapshot stays in the denominator.
    /// Matches the historical behavior.
    #[default]
    Zero,
    /// Absent key is excluded from that snapshot's contribution for that
    /// dimension only.
    Exclude,
}

/// One snapshot's decoded contribution: `None` means "excluded" under
/// [`MissingDimensionPolicy::Exclude`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PartialScores {
    pub dims: [Option<f64>; 5],
}

impl FiveDScores {
    pub fn uniform(v: f64) -> Self {
        let v = v.clamp(SCORE_MIN, SCORE_MAX);
        Self { vision: v, values: v, thinking: v, connection: v, action: v }
    }

    pub fn as_array(&self) -> [f64; 5] {
        [self.vision, self.values, self.thinking, self.connection, self.action]
    }

    pub fn from_array(a: [f64; 5]) -> Self {
        Self { vision: a[0], values: a[1], thinking: a[2], connection: a[3], action: a[4] }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "vision": self.vision,
            "values": self.values,
            "thinking": self.thinking,
            "connection": self.connection,
            "action": self.action,
        })
    }

    /// Strict decode of stored score JSON: all five keys present and numeric,
    /// values clamped into range. Fails loudly on any other shape.
    pub fn decode_strict(value: &serde_json::Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("scores are not a JSON object: {}", value))?;
        let mut out = [0.0f64; 5];
        for (i, key) in DIMENSIONS.iter().enumerate() {
            let v = obj
                .get(*key)
                .ok_or_else(|| format!("missing dimension '{}'", key))?;
            let n = v
                .as_f64()
                .ok_or_else(|| format!("dimension '{}' is not numeric: {}", key, v))?;
            out[i] = n.clamp(SCORE_MIN, SCORE_MAX);
        }
        Ok(Self::from_array(out))
    }

    /// Tolerant decode used by aggregation: an absent key follows `policy`,
    /// but a present non-numeric value still fails loudly.
    pub fn decode_partial(
        value: &serde_json::Value,
        policy: MissingDimensionPolicy,
    ) -> Result<PartialScores, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("scores are not a JSON object: {}", value))?;
        let mut dims = [None; 5];
        for (i, key) in DIMENSIONS.iter().enumerate() {
            dims[i] = match obj.get(*key) {
                Some(v) => {
                    let n = v
                        .as_f64()
                        .ok_or_else(|| format!("dimension '{}' is not numeric: {}", key, v))?;
                    Some(n.clamp(SCORE_MIN, SCORE_MAX))
                }
                None => match policy {
                    MissingDimensionPolicy::Zero => Some(0.0),
                    MissingDimensionPolicy::Exclude => None,
                },
            };
        }
        Ok(PartialScores { dims })
    }
}

/// Where a snapshot came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Onboarding,
    Assignment,
    Reassess,
}

/// Point-in-time five-dimension assessment. Immutable once written; a new
/// assessment always creates a new snapshot, preserving a per-student time
/// series. `scores` stays as persisted JSON and is decoded explicitly at the
/// aggregation boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FiveDSnapshot {
    pub id: String,
    pub user_id: String,
    pub submission_id: Option<String>,
    pub assignment_id: Option<String>,
    pub classroom_id: Option<String>,
    pub source: SnapshotSource,
    pub scores: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Subject-matter proficiency rating plus a suggested next challenge.
/// Immutable once written; one or more rows per submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardSkillAssessment {
    pub submission_id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub domain: String,
    pub skill_component: String,
    pub current_level_percent: f64,
    pub proficiency_description: String,
    pub actionable_challenge: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted feedback row. Carries a verbatim copy of the transcript used,
/// denormalized for later audit even if the live conversation changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignmentFeedback {
    pub submission_id: String,
    pub student_id: String,
    pub assignment_id: String,
    pub student_feedback: String,
    pub teacher_feedback: Option<String>,
    pub conversation_context: Vec<Turn>,
    pub created_at: DateTime<Utc>,
}

/// Roster entry for analytics views.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StudentProfile {
    pub id: String,
    pub full_name: String,
    pub classroom_id: String,
}

/// Assignment metadata; `instructions` feed the tutor's system prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub classroom_id: String,
    pub title: String,
    pub instructions: String,
}
