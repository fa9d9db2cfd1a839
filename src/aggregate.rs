//! Score aggregation: filtered and averaged views over persisted snapshots
//! and skill assessments.
//!
//! The engine is read-only. Views are derived on demand and never persisted.
//! Fetches are bulk-shaped (one call per table) so latency stays bounded at
//! classroom size. The classroom-wide mean is a two-level average: each
//! student's snapshots are averaged first, then the per-student means are
//! averaged, so one highly active student cannot dominate the classroom view.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{instrument, warn};

use crate::domain::{
    Assignment, FiveDScores, FiveDSnapshot, HardSkillAssessment, MissingDimensionPolicy,
    StudentProfile, Submission,
};
use crate::error::PipelineError;
use crate::store::AssessmentStore;

/// "all" or one specific id, for each of the two filter axes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeFilter {
    All,
    One(String),
}

impl ScopeFilter {
    /// Parse the query-string convention: absent or "all" means all.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("") | Some("all") => ScopeFilter::All,
            Some(id) => ScopeFilter::One(id.to_string()),
        }
    }
}

/// Derived average over a selected snapshot subset. `scores: None` means
/// "no data", never a zero-filled record.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateView {
    pub scores: Option<FiveDScores>,
    pub snapshot_count: usize,
    /// True when a store slice failed and was treated as empty.
    pub partial: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAnalytics {
    pub id: String,
    pub full_name: String,
    pub latest_scores: Option<FiveDScores>,
    pub feedback_count: usize,
    /// Newest first.
    pub hard_skills: Vec<HardSkillAssessment>,
}

/// Bulk-fetch shape consumed by the dashboard; filter changes re-slice this
/// instead of re-querying.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomAnalytics {
    pub student_count: usize,
    pub assignment_count: usize,
    pub assignments: Vec<Assignment>,
    pub students: Vec<StudentAnalytics>,
    pub raw_snapshots: Vec<FiveDSnapshot>,
    pub raw_submissions: Vec<Submission>,
    pub partial: bool,
}

pub struct ScoreAggregationEngine {
    records: Arc<dyn AssessmentStore>,
    policy: MissingDimensionPolicy,
}

impl ScoreAggregationEngine {
    pub fn new(records: Arc<dyn AssessmentStore>, policy: MissingDimensionPolicy) -> Self {
        Self { records, policy }
    }

    /// One averaged view for {student = all | id} x {assignment = all | id}.
    #[instrument(level = "info", skip(self), fields(%classroom_id, ?student, ?assignment))]
    pub async fn aggregate(
        &self,
        classroom_id: &str,
        student: &ScopeFilter,
        assignment: &ScopeFilter,
    ) -> Result<AggregateView, PipelineError> {
        if classroom_id.trim().is_empty() {
            return Err(PipelineError::Precondition("missing classroom id".into()));
        }

        let mut partial = false;
        let mut snapshots = match self.records.snapshots_in_classroom(classroom_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "analytics", %classroom_id, error = %e, "Snapshot fetch failed; treating as empty");
                partial = true;
                Vec::new()
            }
        };

        if let ScopeFilter::One(student_id) = student {
            snapshots.retain(|s| &s.user_id == student_id);
        }

        let view = match assignment {
            ScopeFilter::All => match student {
                // Two-level: per-student means first, then across students.
                ScopeFilter::All => self.two_level_mean(&snapshots)?,
                // A single student's own average, returned directly.
                ScopeFilter::One(_) => self.flat_mean(&snapshots)?,
            },
            ScopeFilter::One(assignment_id) => {
                // Legacy snapshots may only carry a submission id; resolve
                // the assignment through the submission linkage.
                let submissions = match self.records.submissions_in_classroom(classroom_id).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(target: "analytics", %classroom_id, error = %e, "Submission fetch failed; direct assignment ids only");
                        partial = true;
                        Vec::new()
                    }
                };
                let by_submission: HashMap<&str, &str> = submissions
                    .iter()
                    .map(|s| (s.id.as_str(), s.assignment_id.as_str()))
                    .collect();
                snapshots.retain(|s| {
                    let resolved = s.assignment_id.as_deref().or_else(|| {
                        s.submission_id
                            .as_deref()
                            .and_then(|sid| by_submission.get(sid).copied())
                    });
                    resolved == Some(assignment_id.as_str())
                });
                self.flat_mean(&snapshots)?
            }
        };

        Ok(AggregateView { scores: view, snapshot_count: snapshots.len(), partial })
    }

    /// Flat mean across the given snapshots, dimension by dimension.
    fn flat_mean(&self, snapshots: &[FiveDSnapshot]) -> Result<Option<FiveDScores>, PipelineError> {
        if snapshots.is_empty() {
            return Ok(None);
        }
        let mut sums = [0.0f64; 5];
        let mut counts = [0usize; 5];
        for snap in snapshots {
            let partial = FiveDScores::decode_partial(&snap.scores, self.policy)
                .map_err(|e| PipelineError::ScoreDecode(format!("snapshot {}: {}", snap.id, e)))?;
            for (i, dim) in partial.dims.iter().enumerate() {
                if let Some(v) = dim {
                    sums[i] += v;
                    counts[i] += 1;
                }
            }
        }
        let mut out = [0.0f64; 5];
        for i in 0..5 {
            if counts[i] > 0 {
                out[i] = sums[i] / counts[i] as f64;
            }
        }
        Ok(Some(FiveDScores::from_array(out)))
    }

    fn two_level_mean(
        &self,
        snapshots: &[FiveDSnapshot],
    ) -> Result<Option<FiveDScores>, PipelineError> {
        let mut by_student: HashMap<&str, Vec<&FiveDSnapshot>> = HashMap::new();
        for s in snapshots {
            by_student.entry(s.user_id.as_str()).or_default().push(s);
        }
        if by_student.is_empty() {
            return Ok(None);
        }
        let mut sums = [0.0f64; 5];
        let mut students = 0usize;
        for (_, group) in by_student {
            let owned: Vec<FiveDSnapshot> = group.into_iter().cloned().collect();
            if let Some(mean) = self.flat_mean(&owned)? {
                let arr = mean.as_array();
                for i in 0..5 {
                    sums[i] += arr[i];
                }
                students += 1;
            }
        }
        if students == 0 {
            return Ok(None);
        }
        let mut out = [0.0f64; 5];
        for i in 0..5 {
            out[i] = sums[i] / students as f64;
        }
        Ok(Some(FiveDScores::from_array(out)))
    }

    /// Skill rows for one assignment across the classroom, grouped per
    /// student. List accumulation only, no averaging.
    #[instrument(level = "info", skip(self), fields(%classroom_id, %assignment_id))]
    pub async fn assignment_skills(
        &self,
        classroom_id: &str,
        assignment_id: &str,
    ) -> Result<HashMap<String, Vec<HardSkillAssessment>>, PipelineError> {
        if classroom_id.trim().is_empty() {
            return Err(PipelineError::Precondition("missing classroom id".into()));
        }
        let submissions = self.records.submissions_in_classroom(classroom_id).await?;
        let ids: Vec<String> = submissions.iter().map(|s| s.id.clone()).collect();
        let rows = self.records.hard_skills_for_submissions(&ids).await?;
        let mut grouped: HashMap<String, Vec<HardSkillAssessment>> = HashMap::new();
        for row in rows {
            if row.assignment_id == assignment_id {
                grouped.entry(row.student_id.clone()).or_default().push(row);
            }
        }
        Ok(grouped)
    }

    /// Bulk dashboard fetch. Failed slices degrade to empty and flip
    /// `partial` instead of failing the whole view.
    #[instrument(level = "info", skip(self), fields(%classroom_id))]
    pub async fn classroom_analytics(
        &self,
        classroom_id: &str,
    ) -> Result<ClassroomAnalytics, PipelineError> {
        if classroom_id.trim().is_empty() {
            return Err(PipelineError::Precondition("missing classroom id".into()));
        }

        let mut partial = false;
        macro_rules! slice {
            ($fetch:expr, $what:literal) => {
                match $fetch {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(target: "analytics", %classroom_id, error = %e, concat!($what, " fetch failed; treating as empty"));
                        partial = true;
                        Vec::new()
                    }
                }
            };
        }

        let students: Vec<StudentProfile> =
            slice!(self.records.students_in_classroom(classroom_id).await, "students");
        let assignments =
            slice!(self.records.assignments_in_classroom(classroom_id).await, "assignments");
        let submissions =
            slice!(self.records.submissions_in_classroom(classroom_id).await, "submissions");
        let snapshots =
            slice!(self.records.snapshots_in_classroom(classroom_id).await, "snapshots");

        let submission_ids: Vec<String> = submissions.iter().map(|s| s.id.clone()).collect();
        let skills = slice!(
            self.records.hard_skills_for_submissions(&submission_ids).await,
            "hard skills"
        );
        let feedback = slice!(
            self.records.feedback_for_submissions(&submission_ids).await,
            "feedback"
        );

        let mut skills_by_student: HashMap<&str, Vec<HardSkillAssessment>> = HashMap::new();
        for row in &skills {
            skills_by_student
                .entry(row.student_id.as_str())
                .or_default()
                .push(row.clone());
        }
        let mut feedback_count: HashMap<&str, usize> = HashMap::new();
        for row in &feedback {
            *feedback_count.entry(row.student_id.as_str()).or_default() += 1;
        }

        let mut rows = Vec::with_capacity(students.len());
        for profile in &students {
            let latest = snapshots
                .iter()
                .filter(|s| s.user_id == profile.id)
                .max_by_key(|s| s.created_at);
            let latest_scores = match latest {
                Some(snap) => match FiveDScores::decode_partial(&snap.scores, self.policy) {
                    Ok(p) => Some(FiveDScores::from_array(p.dims.map(|d| d.unwrap_or(0.0)))),
                    Err(e) => {
                        warn!(target: "analytics", snapshot = %snap.id, error = %e, "Undecodable snapshot in latest-scores view");
                        partial = true;
                        None
                    }
                },
                None => None,
            };
            let mut hard_skills = skills_by_student.remove(profile.id.as_str()).unwrap_or_default();
            hard_skills.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            rows.push(StudentAnalytics {
                id: profile.id.clone(),
                full_name: profile.full_name.clone(),
                latest_scores,
                feedback_count: feedback_count.get(profile.id.as_str()).copied().unwrap_or(0),
                hard_skills,
            });
        }
        rows.sort_by(|a, b| a.full_name.cmp(&b.full_name));

        Ok(ClassroomAnalytics {
            student_count: students.len(),
            assignment_count: assignments.len(),
            assignments,
            students: rows,
            raw_snapshots: snapshots,
            raw_submissions: submissions,
            partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use crate::domain::{SnapshotSource, Submission, SubmissionStatus};
    use crate::store::MemoryStore;

    fn snapshot(
        user: &str,
        classroom: &str,
        scores: serde_json::Value,
        submission: Option<&str>,
        assignment: Option<&str>,
    ) -> FiveDSnapshot {
        FiveDSnapshot {
            id: Uuid::new_v4().to_string(),
            user_id: user.into(),
            submission_id: submission.map(Into::into),
            assignment_id: assignment.map(Into::into),
            classroom_id: Some(classroom.into()),
            source: SnapshotSource::Assignment,
            scores,
            created_at: Utc::now(),
        }
    }

    fn uniform(v: f64) -> serde_json::Value {
        json!({"vision": v, "values": v, "thinking": v, "connection": v, "action": v})
    }

    async fn engine_with(
        snapshots: Vec<FiveDSnapshot>,
        policy: MissingDimensionPolicy,
    ) -> (Arc<MemoryStore>, ScoreAggregationEngine) {
        let store = MemoryStore::new();
        for s in snapshots {
            store.insert_snapshot(s).await.unwrap();
        }
        let engine = ScoreAggregationEngine::new(store.clone(), policy);
        (store, engine)
    }

    #[tokio::test]
    async fn classroom_mean_is_two_level_not_flat() {
        let (_, engine) = engine_with(
            vec![
                snapshot("a", "c1", uniform(8.0), None, None),
                snapshot("a", "c1", uniform(4.0), None, None),
                snapshot("b", "c1", uniform(10.0), None, None),
            ],
            MissingDimensionPolicy::Zero,
        )
        .await;

        let view = engine
            .aggregate("c1", &ScopeFilter::All, &ScopeFilter::All)
            .await
            .unwrap();
        let scores = view.scores.unwrap();
        // (mean(8,4) + 10) / 2 = 8, not (8+4+10)/3 ≈ 7.33
        assert!((scores.vision - 8.0).abs() < 1e-9);
        assert!((scores.action - 8.0).abs() < 1e-9);
        assert_eq!(view.snapshot_count, 3);
    }

    #[tokio::test]
    async fn specific_student_gets_their_own_average() {
        let (_, engine) = engine_with(
            vec![
                snapshot("a", "c1", uniform(8.0), None, None),
                snapshot("a", "c1", uniform(4.0), None, None),
                snapshot("b", "c1", uniform(10.0), None, None),
            ],
            MissingDimensionPolicy::Zero,
        )
        .await;

        let view = engine
            .aggregate("c1", &ScopeFilter::One("a".into()), &ScopeFilter::All)
            .await
            .unwrap();
        assert!((view.scores.unwrap().thinking - 6.0).abs() < 1e-9);
        assert_eq!(view.snapshot_count, 2);
    }

    #[tokio::test]
    async fn empty_selection_is_none_never_zero_filled() {
        let (_, engine) = engine_with(
            vec![snapshot("a", "c1", uniform(8.0), None, Some("asg-1"))],
            MissingDimensionPolicy::Zero,
        )
        .await;

        let view = engine
            .aggregate("c1", &ScopeFilter::All, &ScopeFilter::One("asg-without-snapshots".into()))
            .await
            .unwrap();
        assert!(view.scores.is_none());
        assert_eq!(view.snapshot_count, 0);
    }

    #[tokio::test]
    async fn assignment_filter_resolves_through_submission_linkage() {
        let store = MemoryStore::new();
        store
            .upsert_submission(Submission {
                id: "sub-1".into(),
                student_id: "a".into(),
                assignment_id: "asg-1".into(),
                classroom_id: "c1".into(),
                status: SubmissionStatus::Completed,
            })
            .await;
        // Legacy snapshot: submission id only, no direct assignment id.
        store
            .insert_snapshot(snapshot("a", "c1", uniform(6.0), Some("sub-1"), None))
            .await
            .unwrap();
        // Unrelated snapshot that must be filtered out.
        store
            .insert_snapshot(snapshot("b", "c1", uniform(2.0), None, Some("asg-2")))
            .await
            .unwrap();
        let engine = ScoreAggregationEngine::new(store, MissingDimensionPolicy::Zero);

        let view = engine
            .aggregate("c1", &ScopeFilter::All, &ScopeFilter::One("asg-1".into()))
            .await
            .unwrap();
        assert!((view.scores.unwrap().values - 6.0).abs() < 1e-9);
        assert_eq!(view.snapshot_count, 1);
    }

    #[tokio::test]
    async fn missing_dimension_policy_changes_the_mean() {
        // One snapshot lacks "action"; the other has action = 4.
        let partial = json!({"vision": 8, "values": 8, "thinking": 8, "connection": 8});
        let full = uniform(4.0);

        let (_, zero_engine) = engine_with(
            vec![
                snapshot("a", "c1", partial.clone(), None, None),
                snapshot("a", "c1", full.clone(), None, None),
            ],
            MissingDimensionPolicy::Zero,
        )
        .await;
        let zero = zero_engine
            .aggregate("c1", &ScopeFilter::One("a".into()), &ScopeFilter::All)
            .await
            .unwrap()
            .scores
            .unwrap();
        // Zero policy: (0 + 4) / 2
        assert!((zero.action - 2.0).abs() < 1e-9);

        let (_, excl_engine) = engine_with(
            vec![
                snapshot("a", "c1", partial, None, None),
                snapshot("a", "c1", full, None, None),
            ],
            MissingDimensionPolicy::Exclude,
        )
        .await;
        let excl = excl_engine
            .aggregate("c1", &ScopeFilter::One("a".into()), &ScopeFilter::All)
            .await
            .unwrap()
            .scores
            .unwrap();
        // Exclude policy: only the full snapshot contributes to "action".
        assert!((excl.action - 4.0).abs() < 1e-9);
        // Present dimensions average over both either way.
        assert!((excl.vision - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn corrupt_snapshot_shape_fails_loudly() {
        let (_, engine) = engine_with(
            vec![snapshot("a", "c1", json!({"vision": "high"}), None, None)],
            MissingDimensionPolicy::Zero,
        )
        .await;
        let err = engine
            .aggregate("c1", &ScopeFilter::All, &ScopeFilter::All)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ScoreDecode(_)));
    }

    #[tokio::test]
    async fn missing_classroom_id_is_rejected_before_querying() {
        let (_, engine) = engine_with(vec![], MissingDimensionPolicy::Zero).await;
        let err = engine
            .aggregate("  ", &ScopeFilter::All, &ScopeFilter::All)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
    }

    /// Store whose snapshot slice always fails; everything else is empty.
    struct FailingSnapshots;

    #[async_trait::async_trait]
    impl AssessmentStore for FailingSnapshots {
        async fn submission(
            &self,
            _id: &str,
        ) -> Result<Option<Submission>, crate::error::StoreError> {
            Ok(None)
        }
        async fn set_submission_status(
            &self,
            _id: &str,
            _status: SubmissionStatus,
        ) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn submissions_in_classroom(
            &self,
            _classroom_id: &str,
        ) -> Result<Vec<Submission>, crate::error::StoreError> {
            Ok(Vec::new())
        }
        async fn assignment(
            &self,
            _id: &str,
        ) -> Result<Option<crate::domain::Assignment>, crate::error::StoreError> {
            Ok(None)
        }
        async fn assignments_in_classroom(
            &self,
            _classroom_id: &str,
        ) -> Result<Vec<crate::domain::Assignment>, crate::error::StoreError> {
            Ok(Vec::new())
        }
        async fn student(
            &self,
            _id: &str,
        ) -> Result<Option<crate::domain::StudentProfile>, crate::error::StoreError> {
            Ok(None)
        }
        async fn students_in_classroom(
            &self,
            _classroom_id: &str,
        ) -> Result<Vec<crate::domain::StudentProfile>, crate::error::StoreError> {
            Ok(Vec::new())
        }
        async fn insert_snapshot(
            &self,
            _snapshot: FiveDSnapshot,
        ) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn snapshots_in_classroom(
            &self,
            _classroom_id: &str,
        ) -> Result<Vec<FiveDSnapshot>, crate::error::StoreError> {
            Err(crate::error::StoreError::Unavailable("snapshot table offline".into()))
        }
        async fn insert_hard_skills(
            &self,
            _rows: Vec<HardSkillAssessment>,
        ) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn hard_skills_for_submissions(
            &self,
            _submission_ids: &[String],
        ) -> Result<Vec<HardSkillAssessment>, crate::error::StoreError> {
            Ok(Vec::new())
        }
        async fn insert_feedback(
            &self,
            _row: crate::domain::AssignmentFeedback,
        ) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn feedback_for_submissions(
            &self,
            _submission_ids: &[String],
        ) -> Result<Vec<crate::domain::AssignmentFeedback>, crate::error::StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_snapshot_slice_degrades_to_partial_empty_view() {
        let engine =
            ScoreAggregationEngine::new(Arc::new(FailingSnapshots), MissingDimensionPolicy::Zero);

        let view = engine
            .aggregate("c1", &ScopeFilter::All, &ScopeFilter::All)
            .await
            .unwrap();
        assert!(view.scores.is_none());
        assert!(view.partial);

        let analytics = engine.classroom_analytics("c1").await.unwrap();
        assert!(analytics.partial);
        assert_eq!(analytics.raw_snapshots.len(), 0);
    }

    #[tokio::test]
    async fn analytics_orders_skills_newest_first() {
        let store = MemoryStore::new();
        store
            .upsert_student(crate::domain::StudentProfile {
                id: "a".into(),
                full_name: "Ada".into(),
                classroom_id: "c1".into(),
            })
            .await;
        store
            .upsert_submission(Submission {
                id: "sub-1".into(),
                student_id: "a".into(),
                assignment_id: "asg-1".into(),
                classroom_id: "c1".into(),
                status: SubmissionStatus::Completed,
            })
            .await;
        let old = HardSkillAssessment {
            submission_id: "sub-1".into(),
            assignment_id: "asg-1".into(),
            student_id: "a".into(),
            domain: "math".into(),
            skill_component: "fractions".into(),
            current_level_percent: 40.0,
            proficiency_description: "early".into(),
            actionable_challenge: "simplify 6/8".into(),
            created_at: Utc::now() - Duration::days(3),
        };
        let new = HardSkillAssessment {
            current_level_percent: 70.0,
            created_at: Utc::now(),
            ..old.clone()
        };
        store.insert_hard_skills(vec![old, new]).await.unwrap();
        let engine = ScoreAggregationEngine::new(store, MissingDimensionPolicy::Zero);

        let analytics = engine.classroom_analytics("c1").await.unwrap();
        assert_eq!(analytics.student_count, 1);
        let skills = &analytics.students[0].hard_skills;
        assert_eq!(skills.len(), 2);
        assert!(skills[0].created_at > skills[1].created_at);
        assert_eq!(skills[0].current_level_percent, 70.0);
    }

    #[tokio::test]
    async fn assignment_skills_groups_matching_rows_per_student() {
        let store = MemoryStore::new();
        for (sub, student, asg) in
            [("sub-1", "a", "asg-1"), ("sub-2", "b", "asg-1"), ("sub-3", "a", "asg-2")]
        {
            store
                .upsert_submission(Submission {
                    id: sub.into(),
                    student_id: student.into(),
                    assignment_id: asg.into(),
                    classroom_id: "c1".into(),
                    status: SubmissionStatus::Completed,
                })
                .await;
            store
                .insert_hard_skills(vec![HardSkillAssessment {
                    submission_id: sub.into(),
                    assignment_id: asg.into(),
                    student_id: student.into(),
                    domain: "math".into(),
                    skill_component: "fractions".into(),
                    current_level_percent: 50.0,
                    proficiency_description: "developing".into(),
                    actionable_challenge: "add 1/3 + 1/4".into(),
                    created_at: Utc::now(),
                }])
                .await
                .unwrap();
        }
        let engine = ScoreAggregationEngine::new(store, MissingDimensionPolicy::Zero);

        let grouped = engine.assignment_skills("c1", "asg-1").await.unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["a"].len(), 1);
        assert_eq!(grouped["b"].len(), 1);
        // The asg-2 row never shows up under either student.
        assert!(grouped["a"].iter().all(|r| r.assignment_id == "asg-1"));
    }
}
