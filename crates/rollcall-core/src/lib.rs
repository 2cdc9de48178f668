//! rollcall-core: face pipeline and attendance matching.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime for CPU inference, plus the pure roster
//! matcher that turns detected embeddings into attendance statuses.

pub mod alignment;
pub mod detector;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use matcher::{take_roll, MatchError};
pub use pipeline::{decode_photo, FacePipeline, PipelineError};
pub use recognizer::FaceRecognizer;
pub use types::{
    AttendanceStatus, BoundingBox, DetectedFace, Embedding, RollEntry, RosterDescriptor,
};
