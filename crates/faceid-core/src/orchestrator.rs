//! Detector fallback policy.
//!
//! Embedders are tried in order against the same frame. The first one that
//! finds at least one face wins; the first embedder is tagged `Primary`,
//! every later one `Fallback`. Results from different embedders are never
//! mixed within one frame. "No face" from every embedder is an empty
//! result, not an error; a hard embedder failure propagates immediately.

use crate::frame::Frame;
use crate::types::{BoundingBox, DetectionResult, DetectorSource, Embedding};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw output of an embedder for one face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    pub region: BoundingBox,
    pub embedding: Embedding,
    pub confidence: f32,
}

#[derive(Error, Debug)]
pub enum EmbedderError {
    /// Soft signal: the embedder ran fine but saw no face.
    #[error("no face detected")]
    NoFace,
    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("detection failure in {embedder}: {reason}")]
    DetectionFailure { embedder: String, reason: String },
    #[error("{embedder} produced a {actual}-dim embedding, expected {expected}")]
    DimensionMismatch {
        embedder: String,
        expected: usize,
        actual: usize,
    },
    #[error("no embedders configured")]
    NoEmbedders,
}

/// Face detection + embedding extraction capability.
///
/// Implementations wrap a model runtime or precomputed outputs. `&mut self`
/// because inference sessions are usually stateful.
pub trait Embedder: Send {
    fn name(&self) -> &str;
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>, EmbedderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Detections below this confidence are dropped.
    pub min_confidence: f32,
    /// Expected embedding dimension; `None` accepts whatever arrives.
    pub dimension: Option<usize>,
    /// L2-normalize embeddings before handing them on.
    pub normalize: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
            dimension: None,
            normalize: false,
        }
    }
}

/// Ordered list of embedders tried in sequence.
pub struct DetectionOrchestrator {
    embedders: Vec<Box<dyn Embedder>>,
    config: OrchestratorConfig,
}

impl DetectionOrchestrator {
    pub fn new(embedders: Vec<Box<dyn Embedder>>, config: OrchestratorConfig) -> Self {
        Self { embedders, config }
    }

    pub fn primary_with_fallback(
        primary: Box<dyn Embedder>,
        fallback: Box<dyn Embedder>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::new(vec![primary, fallback], config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Detect faces in one frame, sorted by confidence (highest first).
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionResult>, DetectionError> {
        if self.embedders.is_empty() {
            return Err(DetectionError::NoEmbedders);
        }

        for (index, embedder) in self.embedders.iter_mut().enumerate() {
            let source = if index == 0 {
                DetectorSource::Primary
            } else {
                DetectorSource::Fallback
            };

            let raw = match embedder.detect(frame) {
                Ok(raw) => raw,
                Err(EmbedderError::NoFace) => Vec::new(),
                Err(EmbedderError::Failed(reason)) => {
                    tracing::warn!(embedder = embedder.name(), %reason, "embedder failed");
                    return Err(DetectionError::DetectionFailure {
                        embedder: embedder.name().to_string(),
                        reason,
                    });
                }
            };

            let results = normalize(embedder.name(), raw, source, &self.config)?;
            if results.is_empty() {
                tracing::debug!(embedder = embedder.name(), ?source, "no face; trying next embedder");
                continue;
            }

            if source == DetectorSource::Fallback {
                tracing::info!(
                    embedder = embedder.name(),
                    faces = results.len(),
                    "fallback embedder found faces"
                );
            }
            return Ok(results);
        }

        Ok(Vec::new())
    }
}

fn normalize(
    embedder: &str,
    raw: Vec<FaceDetection>,
    source: DetectorSource,
    config: &OrchestratorConfig,
) -> Result<Vec<DetectionResult>, DetectionError> {
    let mut results = Vec::with_capacity(raw.len());

    for det in raw {
        let confidence = if det.confidence.is_finite() {
            det.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if confidence < config.min_confidence {
            continue;
        }

        if let Some(expected) = config.dimension {
            if det.embedding.dimension() != expected {
                return Err(DetectionError::DimensionMismatch {
                    embedder: embedder.to_string(),
                    expected,
                    actual: det.embedding.dimension(),
                });
            }
        }

        let mut embedding = det.embedding;
        if config.normalize {
            embedding.normalize();
        }

        results.push(DetectionResult {
            region: det.region,
            embedding,
            detector_confidence: confidence,
            detector_source: source,
        });
    }

    results.sort_by(|a, b| {
        b.detector_confidence
            .partial_cmp(&a.detector_confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(results)
}
