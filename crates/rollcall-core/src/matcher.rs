//! Roster matching: who in the photo is which enrolled student.
//!
//! Decides one [`AttendanceStatus`] per roster student from the embeddings
//! found in a classroom photo. Pure computation, no IO.

use crate::types::{AttendanceStatus, Embedding, RollEntry, RosterDescriptor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("descriptor dimension mismatch for {subject}: expected {expected}, got {got}")]
    DimensionMismatch {
        subject: String,
        expected: usize,
        got: usize,
    },
}

/// Take attendance for a roster against the faces detected in one photo.
///
/// For each student, in roster order:
/// - no descriptor on file: `Unknown`, no comparison is attempted;
/// - otherwise the detected embeddings are scanned in detection order and
///   the first one at Euclidean distance strictly below `threshold` marks
///   the student `Present` (first match wins; remaining faces are not
///   inspected, and a face already claimed by an earlier student can be
///   claimed again);
/// - no detected embedding close enough, or none detected at all: `Absent`.
///
/// `threshold` is the maximum distance at which two embeddings still count
/// as the same person; smaller is stricter. All embeddings must share one
/// dimensionality, checked up front before any entry is produced.
pub fn take_roll(
    roster: &[RosterDescriptor],
    detected: &[Embedding],
    threshold: f32,
) -> Result<Vec<RollEntry>, MatchError> {
    check_dimensions(roster, detected)?;

    let entries = roster
        .iter()
        .map(|student| match &student.descriptor {
            None => RollEntry {
                username: student.username.clone(),
                status: AttendanceStatus::Unknown,
                matched_face: None,
                distance: None,
            },
            Some(descriptor) => {
                let hit = detected
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (i, descriptor.euclidean_distance(e)))
                    .find(|(_, d)| *d < threshold);

                match hit {
                    Some((i, d)) => RollEntry {
                        username: student.username.clone(),
                        status: AttendanceStatus::Present,
                        matched_face: Some(i),
                        distance: Some(d),
                    },
                    None => RollEntry {
                        username: student.username.clone(),
                        status: AttendanceStatus::Absent,
                        matched_face: None,
                        distance: None,
                    },
                }
            }
        })
        .collect();

    Ok(entries)
}

/// Verify every embedding in play shares one dimensionality.
///
/// The reference dimension is taken from the first enrolled descriptor,
/// falling back to the first detected embedding. A mismatch fails the
/// whole call before any entry is produced.
fn check_dimensions(
    roster: &[RosterDescriptor],
    detected: &[Embedding],
) -> Result<(), MatchError> {
    let reference = roster
        .iter()
        .find_map(|s| s.descriptor.as_ref().map(|d| d.dim()))
        .or_else(|| detected.first().map(|e| e.dim()));

    let Some(expected) = reference else {
        return Ok(());
    };

    for student in roster {
        if let Some(descriptor) = &student.descriptor {
            if descriptor.dim() != expected {
                return Err(MatchError::DimensionMismatch {
                    subject: format!("student {}", student.username),
                    expected,
                    got: descriptor.dim(),
                });
            }
        }
    }

    for (i, embedding) in detected.iter().enumerate() {
        if embedding.dim() != expected {
            return Err(MatchError::DimensionMismatch {
                subject: format!("detected face {i}"),
                expected,
                got: embedding.dim(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    fn student(username: &str, descriptor: Option<Embedding>) -> RosterDescriptor {
        RosterDescriptor { username: username.to_string(), descriptor }
    }

    #[test]
    fn test_no_descriptor_is_unknown() {
        let roster = vec![student("amy", None)];
        // Even with a face in the photo, nothing to compare against.
        let detected = vec![emb(&[1.0, 0.0])];

        let entries = take_roll(&roster, &detected, 0.4).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AttendanceStatus::Unknown);
        assert_eq!(entries[0].matched_face, None);
    }

    #[test]
    fn test_empty_photo_is_absent() {
        let roster = vec![student("amy", Some(emb(&[1.0, 0.0])))];
        let entries = take_roll(&roster, &[], 0.4).unwrap();
        assert_eq!(entries[0].status, AttendanceStatus::Absent);
    }

    #[test]
    fn test_identical_descriptor_is_present_at_any_threshold() {
        let d = emb(&[0.25, -0.5, 0.75]);
        let roster = vec![student("amy", Some(d.clone()))];
        let entries = take_roll(&roster, &[d], 1e-6).unwrap();
        assert_eq!(entries[0].status, AttendanceStatus::Present);
        assert_eq!(entries[0].matched_face, Some(0));
        assert!(entries[0].distance.unwrap() < 1e-6);
    }

    #[test]
    fn test_first_match_wins_on_ties() {
        // Two detected faces equally close; the earlier index must win.
        let roster = vec![student("amy", Some(emb(&[0.0, 0.0])))];
        let detected = vec![emb(&[0.1, 0.0]), emb(&[0.0, 0.1])];

        let entries = take_roll(&roster, &detected, 0.4).unwrap();
        assert_eq!(entries[0].status, AttendanceStatus::Present);
        assert_eq!(entries[0].matched_face, Some(0));
    }

    #[test]
    fn test_threshold_is_strict() {
        // Distance exactly equal to the threshold does not count.
        let roster = vec![student("amy", Some(emb(&[0.0, 0.0])))];
        let detected = vec![emb(&[0.3, 0.4])]; // distance 0.5

        let at = take_roll(&roster, &detected, 0.5).unwrap();
        assert_eq!(at[0].status, AttendanceStatus::Absent);

        let above = take_roll(&roster, &detected, 0.5 + 1e-3).unwrap();
        assert_eq!(above[0].status, AttendanceStatus::Present);
    }

    #[test]
    fn test_matched_present_and_missing_student() {
        // Roster [S1 with descriptor, S2 without], photo holds S1's face at
        // distance 0.1: S1 present, S2 unknown.
        let roster = vec![
            student("s1", Some(emb(&[0.0, 0.0]))),
            student("s2", None),
        ];
        let detected = vec![emb(&[0.1, 0.0])];

        let entries = take_roll(&roster, &detected, 0.4).unwrap();
        assert_eq!(entries[0].status, AttendanceStatus::Present);
        assert_eq!(entries[1].status, AttendanceStatus::Unknown);
    }

    #[test]
    fn test_empty_photo_scenario() {
        let roster = vec![
            student("s1", Some(emb(&[0.0, 0.0]))),
            student("s2", None),
        ];
        let entries = take_roll(&roster, &[], 0.4).unwrap();
        assert_eq!(entries[0].status, AttendanceStatus::Absent);
        assert_eq!(entries[1].status, AttendanceStatus::Unknown);
    }

    #[test]
    fn test_tight_threshold_rejects_near_match() {
        // Same geometry as above but threshold 0.05 < distance 0.1.
        let roster = vec![
            student("s1", Some(emb(&[0.0, 0.0]))),
            student("s2", None),
        ];
        let detected = vec![emb(&[0.1, 0.0])];

        let entries = take_roll(&roster, &detected, 0.05).unwrap();
        assert_eq!(entries[0].status, AttendanceStatus::Absent);
        assert_eq!(entries[1].status, AttendanceStatus::Unknown);
    }

    #[test]
    fn test_idempotent() {
        let roster = vec![
            student("s1", Some(emb(&[0.0, 1.0]))),
            student("s2", Some(emb(&[1.0, 0.0]))),
            student("s3", None),
        ];
        let detected = vec![emb(&[0.05, 0.95]), emb(&[0.9, 0.1])];

        let first = take_roll(&roster, &detected, 0.4).unwrap();
        let second = take_roll(&roster, &detected, 0.4).unwrap();
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.username, b.username);
            assert_eq!(a.status, b.status);
            assert_eq!(a.matched_face, b.matched_face);
        }
    }

    #[test]
    fn test_roster_order_preserved() {
        let roster = vec![
            student("zoe", None),
            student("amy", Some(emb(&[0.0, 0.0]))),
            student("bob", None),
        ];
        let entries = take_roll(&roster, &[], 0.4).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.username.as_str()).collect();
        assert_eq!(names, ["zoe", "amy", "bob"]);
    }

    #[test]
    fn test_two_students_can_claim_one_face() {
        // Greedy per-student scan: a face is not consumed by a match, so
        // twins (or a duplicate enrollment) both end up present.
        let d = emb(&[0.0, 0.0]);
        let roster = vec![
            student("s1", Some(d.clone())),
            student("s2", Some(d.clone())),
        ];
        let detected = vec![emb(&[0.1, 0.0])];

        let entries = take_roll(&roster, &detected, 0.4).unwrap();
        assert_eq!(entries[0].status, AttendanceStatus::Present);
        assert_eq!(entries[1].status, AttendanceStatus::Present);
        assert_eq!(entries[0].matched_face, entries[1].matched_face);
    }

    #[test]
    fn test_dimension_mismatch_fails_fast() {
        let roster = vec![
            student("s1", Some(emb(&[0.0, 0.0, 0.0]))),
            student("s2", Some(emb(&[0.0, 0.0]))),
        ];
        let err = take_roll(&roster, &[], 0.4).unwrap_err();
        match err {
            MatchError::DimensionMismatch { subject, expected, got } => {
                assert_eq!(subject, "student s2");
                assert_eq!(expected, 3);
                assert_eq!(got, 2);
            }
        }
    }

    #[test]
    fn test_detected_dimension_mismatch() {
        let roster = vec![student("s1", Some(emb(&[0.0, 0.0])))];
        let detected = vec![emb(&[0.0, 0.0]), emb(&[0.0, 0.0, 0.0])];
        let err = take_roll(&roster, &detected, 0.4).unwrap_err();
        match err {
            MatchError::DimensionMismatch { subject, got, .. } => {
                assert_eq!(subject, "detected face 1");
                assert_eq!(got, 3);
            }
        }
    }

    #[test]
    fn test_empty_roster() {
        let entries = take_roll(&[], &[emb(&[1.0, 0.0])], 0.4).unwrap();
        assert!(entries.is_empty());
    }
}
