use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Number of dimensions in this embedding.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found in a photo: where it is, and who it looks like.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub face: BoundingBox,
    pub embedding: Embedding,
}

/// Attendance outcome for one student in one session.
///
/// `Unknown` means the student has no descriptor on file and could not be
/// looked for at all. It is a data-availability signal, distinct from
/// `Absent` (descriptor on file, nobody in the photo matched it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Unknown,
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Unknown => "unknown",
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown attendance status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for AttendanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(AttendanceStatus::Unknown),
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A roster student as the matcher sees them: a username and whatever
/// descriptor is on file (none if they never enrolled a face).
#[derive(Debug, Clone)]
pub struct RosterDescriptor {
    pub username: String,
    pub descriptor: Option<Embedding>,
}

/// Per-student outcome of one roll call.
///
/// `matched_face` and `distance` are set only for `Present` entries and
/// identify which detected face won, in detection order.
#[derive(Debug, Clone, Serialize)]
pub struct RollEntry {
    pub username: String,
    pub status: AttendanceStatus,
    pub matched_face: Option<usize>,
    pub distance: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding { values: vec![1.0, 2.0, 3.0], model_version: None };
        let b = Embedding { values: vec![1.0, 2.0, 3.0], model_version: None };
        assert!(a.euclidean_distance(&b).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_unit_apart() {
        let a = Embedding { values: vec![0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![3.0, 4.0], model_version: None };
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_symmetric() {
        let a = Embedding { values: vec![0.5, -1.0, 2.0], model_version: None };
        let b = Embedding { values: vec![-0.5, 1.0, 0.0], model_version: None };
        assert!((a.euclidean_distance(&b) - b.euclidean_distance(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_status_text_roundtrip() {
        for status in [
            AttendanceStatus::Unknown,
            AttendanceStatus::Present,
            AttendanceStatus::Absent,
        ] {
            let parsed: AttendanceStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_rejects_unknown_text() {
        assert!("late".parse::<AttendanceStatus>().is_err());
        assert!("PRESENT".parse::<AttendanceStatus>().is_err());
        assert!("".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&AttendanceStatus::Present).unwrap();
        assert_eq!(json, "\"present\"");
    }
}
