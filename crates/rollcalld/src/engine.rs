use rollcall_core::{decode_photo, DetectedFace, Embedding, FacePipeline, PipelineError};
use rollcall_core::recognizer::{ARCFACE_EMBEDDING_DIM, ARCFACE_MODEL_VERSION};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// What the engine is running, reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub detector: &'static str,
    pub recognizer: &'static str,
    pub embedding_dim: usize,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Analyze {
        photo: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<DetectedFace>, EngineError>>,
    },
    Enroll {
        photo: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    models: ModelStatus,
}

impl EngineHandle {
    pub fn models(&self) -> &ModelStatus {
        &self.models
    }

    /// Decode a photo and extract an embedding for every detected face,
    /// in detection order. Zero faces yields an empty vec.
    pub async fn analyze(&self, photo: Vec<u8>) -> Result<Vec<DetectedFace>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                photo,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Decode a photo and extract an embedding from its first detected
    /// face. Zero faces is an error.
    pub async fn enroll(&self, photo: Vec<u8>) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                photo,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the inference engine on a dedicated OS thread.
///
/// Loads both ONNX models, then enters a request loop. The ONNX sessions
/// live on that thread for their whole life; requests queue up in a small
/// channel and are served one at a time. Fails fast at startup if either
/// model is unavailable.
pub fn spawn_engine(scrfd_path: &str, arcface_path: &str) -> Result<EngineHandle, EngineError> {
    let mut pipeline = FacePipeline::load(scrfd_path, arcface_path)?;
    tracing::info!(path = scrfd_path, "SCRFD detector loaded");
    tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

    let models = ModelStatus {
        detector: "scrfd_10g",
        recognizer: ARCFACE_MODEL_VERSION,
        embedding_dim: ARCFACE_EMBEDDING_DIM,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { photo, reply } => {
                        let _ = reply.send(run_analyze(&mut pipeline, &photo));
                    }
                    EngineRequest::Enroll { photo, reply } => {
                        let _ = reply.send(run_enroll(&mut pipeline, &photo));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx, models })
}

/// Decode the photo bytes and embed every face in it. Decoding is
/// CPU-bound and stays on the engine thread with the inference.
fn run_analyze(pipeline: &mut FacePipeline, photo: &[u8]) -> Result<Vec<DetectedFace>, EngineError> {
    let image = decode_photo(photo)?;
    let faces = pipeline.analyze(&image)?;
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        faces = faces.len(),
        "analyze: photo processed"
    );
    Ok(faces)
}

fn run_enroll(pipeline: &mut FacePipeline, photo: &[u8]) -> Result<Embedding, EngineError> {
    let image = decode_photo(photo)?;
    let embedding = pipeline.enroll(&image)?;
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        dim = embedding.dim(),
        "enroll: face embedded"
    );
    Ok(embedding)
}
