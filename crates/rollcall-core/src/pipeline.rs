//! Photo analysis pipeline: decode, detect, embed.
//!
//! Ties the SCRFD detector and ArcFace recognizer together behind the two
//! operations the rest of the system needs: analyze a classroom photo into
//! embeddings, and extract a single enrollment embedding.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{DetectedFace, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unreadable photo: {0}")]
    UnreadablePhoto(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Decode uploaded photo bytes into an RGB image.
///
/// Bytes that do not decode as an image are an input error, distinct from a
/// photo that decodes fine but contains no faces.
pub fn decode_photo(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::UnreadablePhoto(e.to_string()))?;
    Ok(img.to_rgb8())
}

/// Both ONNX models behind one handle. Inference takes `&mut self`, so one
/// pipeline serves one thread at a time.
pub struct FacePipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FacePipeline {
    /// Load both models, failing fast on the first missing or broken file.
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, PipelineError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            recognizer: FaceRecognizer::load(recognizer_path)?,
        })
    }

    /// Detect every face in a photo and extract an embedding for each.
    ///
    /// Faces come back in detection order (confidence-descending). A photo
    /// with zero faces yields an empty vec, not an error.
    pub fn analyze(&mut self, photo: &RgbImage) -> Result<Vec<DetectedFace>, PipelineError> {
        let faces = self.detector.detect(photo)?;
        let mut detected = Vec::with_capacity(faces.len());
        for face in faces {
            let embedding = self.recognizer.extract(photo, &face)?;
            detected.push(DetectedFace { face, embedding });
        }
        Ok(detected)
    }

    /// Extract the enrollment embedding from a photo.
    ///
    /// Takes the first face in detection order; any further faces are
    /// ignored. Zero faces is an error, never an empty embedding.
    pub fn enroll(&mut self, photo: &RgbImage) -> Result<Embedding, PipelineError> {
        let faces = self.detector.detect(photo)?;
        let face = faces.into_iter().next().ok_or(PipelineError::NoFaceDetected)?;
        Ok(self.recognizer.extract(photo, &face)?)
    }
}
