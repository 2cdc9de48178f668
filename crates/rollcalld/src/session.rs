use crate::engine::{EngineError, EngineHandle};
use rollcall_core::{take_roll, AttendanceStatus, MatchError, RollEntry, RosterDescriptor};
use rollcall_store::{DescriptorError, DescriptorStore, SchoolStore, StoreError};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("match error: {0}")]
    Match(#[from] MatchError),
}

/// Everything one session produced, echoed back to the caller. The same
/// rows now sit in the ledger under `session_id`.
#[derive(Debug, Serialize)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub course_id: String,
    pub faces_detected: usize,
    pub present: usize,
    pub absent: usize,
    pub unknown: usize,
    pub entries: Vec<RollEntry>,
}

/// Run one attendance session for a course: snapshot the roster, load its
/// descriptors, embed every face in the photo, take the roll, and append
/// the outcome to the ledger in a single transaction.
pub async fn run_session(
    school: &SchoolStore,
    descriptors: &DescriptorStore,
    engine: &EngineHandle,
    threshold: f32,
    course_id: &str,
    photo: Vec<u8>,
) -> Result<SessionOutcome, SessionError> {
    let started = Instant::now();
    let session_id = Uuid::new_v4();

    let roster = school.roster(course_id).await?;

    let mut gallery = Vec::with_capacity(roster.len());
    for member in &roster {
        gallery.push(RosterDescriptor {
            username: member.username.clone(),
            descriptor: descriptors.get(&member.username).await?,
        });
    }

    let detected: Vec<_> = engine
        .analyze(photo)
        .await?
        .into_iter()
        .map(|f| f.embedding)
        .collect();

    let entries = take_roll(&gallery, &detected, threshold)?;

    school
        .append_session(
            course_id,
            &session_id.to_string(),
            entries
                .iter()
                .map(|e| (e.username.clone(), e.status))
                .collect(),
        )
        .await?;

    let count = |status: AttendanceStatus| entries.iter().filter(|e| e.status == status).count();
    let outcome = SessionOutcome {
        session_id,
        course_id: course_id.to_string(),
        faces_detected: detected.len(),
        present: count(AttendanceStatus::Present),
        absent: count(AttendanceStatus::Absent),
        unknown: count(AttendanceStatus::Unknown),
        entries,
    };

    tracing::info!(
        course = course_id,
        session = %outcome.session_id,
        faces = outcome.faces_detected,
        present = outcome.present,
        absent = outcome.absent,
        unknown = outcome.unknown,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "attendance session complete"
    );

    Ok(outcome)
}
