use faceid_core::{
    DetectionError, DetectionOrchestrator, DetectionResult, EnrollmentSample, Frame,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detection error: {0}")]
    Detection(#[from] DetectionError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Faces found in one frame, plus the scene statistic used for matching.
#[derive(Debug, Clone)]
pub struct FrameDetections {
    pub detections: Vec<DetectionResult>,
    pub scene_variance: f32,
}

/// Samples gathered from one enrollment burst.
#[derive(Debug, Clone)]
pub struct EnrollCapture {
    pub samples: Vec<EnrollmentSample>,
    /// Frames handed to the engine.
    pub frames: usize,
    /// Frames in which no face was found.
    pub missed: usize,
}

/// Messages sent from command handlers to the engine thread.
enum EngineRequest {
    Detect {
        frame: Frame,
        reply: oneshot::Sender<Result<FrameDetections, EngineError>>,
    },
    Enroll {
        frames: Vec<Frame>,
        reply: oneshot::Sender<Result<EnrollCapture, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Detect every face in one frame.
    pub async fn detect(&self, frame: Frame) -> Result<FrameDetections, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run detection over a burst, keeping the best face of each frame.
    pub async fn enroll(&self, frames: Vec<Frame>) -> Result<EnrollCapture, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                frames,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread that owns the embedders.
pub fn spawn_engine(mut orchestrator: DetectionOrchestrator) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("faceid-engine".into())
        .spawn(move || {
            tracing::debug!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { frame, reply } => {
                        let _ = reply.send(run_detect(&mut orchestrator, &frame));
                    }
                    EngineRequest::Enroll { frames, reply } => {
                        let _ = reply.send(run_enroll(&mut orchestrator, &frames));
                    }
                }
            }
            tracing::debug!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_detect(
    orchestrator: &mut DetectionOrchestrator,
    frame: &Frame,
) -> Result<FrameDetections, EngineError> {
    let detections = orchestrator.detect(frame)?;
    Ok(FrameDetections {
        detections,
        scene_variance: frame.variance(),
    })
}

/// One sample per frame: the highest-confidence face. A hard failure on any
/// frame aborts the burst.
fn run_enroll(
    orchestrator: &mut DetectionOrchestrator,
    frames: &[Frame],
) -> Result<EnrollCapture, EngineError> {
    let mut samples = Vec::with_capacity(frames.len());
    let mut missed = 0;

    for (i, frame) in frames.iter().enumerate() {
        let mut detections = orchestrator.detect(frame)?;
        if detections.len() > 1 {
            tracing::warn!(frame = i, faces = detections.len(), "enroll: several faces, using the most confident");
        }
        if detections.is_empty() {
            tracing::debug!(frame = i, "enroll: no face");
            missed += 1;
            continue;
        }
        samples.push(EnrollmentSample::from(detections.swap_remove(0)));
    }

    tracing::info!(frames = frames.len(), usable = samples.len(), missed, "enroll: burst processed");
    Ok(EnrollCapture {
        samples,
        frames: frames.len(),
        missed,
    })
}
