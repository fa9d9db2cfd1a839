//! Relational-store contracts and the in-memory implementation.
//!
//! The pipeline treats storage as an external collaborator: these traits are
//! the read/write contracts it needs, nothing more. Tables mirror the hosted
//! store (`submissions`, `assignment_conversations`, `assignment_feedback`,
//! `five_d_snapshots`, `hard_skill_assessments`) plus the roster tables the
//! analytics views join against. Reads used by aggregation are bulk-shaped
//! (one call per table across all relevant ids) so classroom-sized views stay
//! a fixed number of queries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::domain::{
    Assignment, AssignmentFeedback, Conversation, FiveDSnapshot, HardSkillAssessment,
    StudentProfile, Submission, SubmissionStatus,
};
use crate::error::StoreError;

/// Durable, append-only-by-replace log of turn messages per submission.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load the conversation for a submission, if one exists.
    async fn load_conversation(&self, submission_id: &str)
        -> Result<Option<Conversation>, StoreError>;

    /// Persist the whole conversation, replacing any prior row for the same
    /// submission. Combined with read-before-write in the orchestrator this
    /// keeps at most one conversation per submission.
    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;
}

/// Submissions, score snapshots, skill assessments, feedback rows, and the
/// roster tables analytics joins against.
#[async_trait]
pub trait AssessmentStore: Send + Sync {
    async fn submission(&self, id: &str) -> Result<Option<Submission>, StoreError>;
    async fn set_submission_status(
        &self,
        id: &str,
        status: SubmissionStatus,
    ) -> Result<(), StoreError>;
    async fn submissions_in_classroom(
        &self,
        classroom_id: &str,
    ) -> Result<Vec<Submission>, StoreError>;

    async fn assignment(&self, id: &str) -> Result<Option<Assignment>, StoreError>;
    async fn assignments_in_classroom(
        &self,
        classroom_id: &str,
    ) -> Result<Vec<Assignment>, StoreError>;

    async fn student(&self, id: &str) -> Result<Option<StudentProfile>, StoreError>;
    async fn students_in_classroom(
        &self,
        classroom_id: &str,
    ) -> Result<Vec<StudentProfile>, StoreError>;

    async fn insert_snapshot(&self, snapshot: FiveDSnapshot) -> Result<(), StoreError>;
    async fn snapshots_in_classroom(
        &self,
        classroom_id: &str,
    ) -> Result<Vec<FiveDSnapshot>, StoreError>;

    async fn insert_hard_skills(
        &self,
        rows: Vec<HardSkillAssessment>,
    ) -> Result<(), StoreError>;
    async fn hard_skills_for_submissions(
        &self,
        submission_ids: &[String],
    ) -> Result<Vec<HardSkillAssessment>, StoreError>;

    async fn insert_feedback(&self, row: AssignmentFeedback) -> Result<(), StoreError>;
    async fn feedback_for_submissions(
        &self,
        submission_ids: &[String],
    ) -> Result<Vec<AssignmentFeedback>, StoreError>;
}

/// In-memory store backing both contracts. Tables are `RwLock`-guarded maps
/// and vecs named after their relational counterparts.
#[derive(Default)]
pub struct MemoryStore {
    submissions: RwLock<HashMap<String, Submission>>,
    assignment_conversations: RwLock<HashMap<String, Conversation>>,
    assignment_feedback: RwLock<Vec<AssignmentFeedback>>,
    five_d_snapshots: RwLock<Vec<FiveDSnapshot>>,
    hard_skill_assessments: RwLock<Vec<HardSkillAssessment>>,
    students: RwLock<HashMap<String, StudentProfile>>,
    assignments: RwLock<HashMap<String, Assignment>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn upsert_submission(&self, s: Submission) {
        self.submissions.write().await.insert(s.id.clone(), s);
    }

    pub async fn upsert_student(&self, s: StudentProfile) {
        self.students.write().await.insert(s.id.clone(), s);
    }

    pub async fn upsert_assignment(&self, a: Assignment) {
        self.assignments.write().await.insert(a.id.clone(), a);
    }

    /// Number of stored conversations (test and diagnostics helper).
    #[allow(dead_code)]
    pub async fn conversation_count(&self) -> usize {
        self.assignment_conversations.read().await.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    #[instrument(level = "debug", skip(self))]
    async fn load_conversation(
        &self,
        submission_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .assignment_conversations
            .read()
            .await
            .get(submission_id)
            .cloned())
    }

    #[instrument(level = "debug", skip(self, conversation), fields(submission_id = %conversation.submission_id, turns = conversation.turns.len()))]
    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.assignment_conversations
            .write()
            .await
            .insert(conversation.submission_id.clone(), conversation.clone());
        Ok(())
    }
}

#[async_trait]
impl AssessmentStore for MemoryStore {
    async fn submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.submissions.read().await.get(id).cloned())
    }

    async fn set_submission_status(
        &self,
        id: &str,
        status: SubmissionStatus,
    ) -> Result<(), StoreError> {
        let mut map = self.submissions.write().await;
        let row = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("submission {}", id)))?;
        row.status = status;
        Ok(())
    }

    async fn submissions_in_classroom(
        &self,
        classroom_id: &str,
    ) -> Result<Vec<Submission>, StoreError> {
        Ok(self
            .submissions
            .read()
            .await
            .values()
            .filter(|s| s.classroom_id == classroom_id)
            .cloned()
            .collect())
    }

    async fn assignment(&self, id: &str) -> Result<Option<Assignment>, StoreError> {
        Ok(self.assignments.read().await.get(id).cloned())
    }

    async fn assignments_in_classroom(
        &self,
        classroom_id: &str,
    ) -> Result<Vec<Assignment>, StoreError> {
        Ok(self
            .assignments
            .read()
            .await
            .values()
            .filter(|a| a.classroom_id == classroom_id)
            .cloned()
            .collect())
    }

    async fn student(&self, id: &str) -> Result<Option<StudentProfile>, StoreError> {
        Ok(self.students.read().await.get(id).cloned())
    }

    async fn students_in_classroom(
        &self,
        classroom_id: &str,
    ) -> Result<Vec<StudentProfile>, StoreError> {
        Ok(self
            .students
            .read()
            .await
            .values()
            .filter(|s| s.classroom_id == classroom_id)
            .cloned()
            .collect())
    }

    async fn insert_snapshot(&self, snapshot: FiveDSnapshot) -> Result<(), StoreError> {
        self.five_d_snapshots.write().await.push(snapshot);
        Ok(())
    }

    async fn snapshots_in_classroom(
        &self,
        classroom_id: &str,
    ) -> Result<Vec<FiveDSnapshot>, StoreError> {
        Ok(self
            .five_d_snapshots
            .read()
            .await
            .iter()
            .filter(|s| s.classroom_id.as_deref() == Some(classroom_id))
            .cloned()
            .collect())
    }

    async fn insert_hard_skills(
        &self,
        rows: Vec<HardSkillAssessment>,
    ) -> Result<(), StoreError> {
        self.hard_skill_assessments.write().await.extend(rows);
        Ok(())
    }

    async fn hard_skills_for_submissions(
        &self,
        submission_ids: &[String],
    ) -> Result<Vec<HardSkillAssessment>, StoreError> {
        Ok(self
            .hard_skill_assessments
            .read()
            .await
            .iter()
            .filter(|r| submission_ids.contains(&r.submission_id))
            .cloned()
            .collect())
    }

    async fn insert_feedback(&self, row: AssignmentFeedback) -> Result<(), StoreError> {
        self.assignment_feedback.write().await.push(row);
        Ok(())
    }

    async fn feedback_for_submissions(
        &self,
        submission_ids: &[String],
    ) -> Result<Vec<AssignmentFeedback>, StoreError> {
        Ok(self
            .assignment_feedback
            .read()
            .await
            .iter()
            .filter(|r| submission_ids.contains(&r.submission_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Turn;

    #[tokio::test]
    async fn save_conversation_replaces_by_submission_id() {
        let store = MemoryStore::new();

        let mut c = Conversation::new("s1");
        c.turns.push(Turn::assistant("hello"));
        store.save_conversation(&c).await.unwrap();

        c.turns.push(Turn::user("hi"));
        store.save_conversation(&c).await.unwrap();

        assert_eq!(store.conversation_count().await, 1);
        let loaded = store.load_conversation("s1").await.unwrap().unwrap();
        assert_eq!(loaded.turns.len(), 2);
    }

    #[tokio::test]
    async fn status_update_on_missing_submission_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .set_submission_status("nope", SubmissionStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
