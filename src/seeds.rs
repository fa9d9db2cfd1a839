//! Seed data: a small demo classroom so the API is exercisable without an
//! external provisioning step.

use chrono::Utc;
use uuid::Uuid;

use crate::domain::{
    Assignment, FiveDScores, FiveDSnapshot, SnapshotSource, StudentProfile, Submission,
    SubmissionStatus,
};
use crate::store::{AssessmentStore, MemoryStore};

pub const DEMO_CLASSROOM: &str = "classroom-demo";

/// Populate the in-memory store with one classroom, two students, two
/// assignments, and an onboarding snapshot per student.
pub async fn seed_demo_classroom(store: &MemoryStore) {
    store
        .upsert_student(StudentProfile {
            id: "student-ada".into(),
            full_name: "Ada Moreno".into(),
            classroom_id: DEMO_CLASSROOM.into(),
        })
        .await;
    store
        .upsert_student(StudentProfile {
            id: "student-ben".into(),
            full_name: "Ben Okafor".into(),
            classroom_id: DEMO_CLASSROOM.into(),
        })
        .await;

    store
        .upsert_assignment(Assignment {
            id: "assignment-photosynthesis".into(),
            classroom_id: DEMO_CLASSROOM.into(),
            title: "Photosynthesis".into(),
            instructions: "Guide the student to explain how plants convert light into \
chemical energy, including the role of chlorophyll."
                .into(),
        })
        .await;
    store
        .upsert_assignment(Assignment {
            id: "assignment-fractions".into(),
            classroom_id: DEMO_CLASSROOM.into(),
            title: "Adding Fractions".into(),
            instructions: "Guide the student to add fractions with unlike denominators and \
explain why a common denominator is needed."
                .into(),
        })
        .await;

    store
        .upsert_submission(Submission {
            id: "submission-ada-photo".into(),
            student_id: "student-ada".into(),
            assignment_id: "assignment-photosynthesis".into(),
            classroom_id: DEMO_CLASSROOM.into(),
            status: SubmissionStatus::InProgress,
        })
        .await;
    store
        .upsert_submission(Submission {
            id: "submission-ben-fractions".into(),
            student_id: "student-ben".into(),
            assignment_id: "assignment-fractions".into(),
            classroom_id: DEMO_CLASSROOM.into(),
            status: SubmissionStatus::InProgress,
        })
        .await;

    for (user, base) in [("student-ada", 6.0), ("student-ben", 5.0)] {
        let _ = store
            .insert_snapshot(FiveDSnapshot {
                id: Uuid::new_v4().to_string(),
                user_id: user.into(),
                submission_id: None,
                assignment_id: None,
                classroom_id: Some(DEMO_CLASSROOM.into()),
                source: SnapshotSource::Onboarding,
                scores: FiveDScores::uniform(base).to_value(),
                created_at: Utc::now(),
            })
            .await;
    }
}
