use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default)]
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (128-dimensional for dlib-style encoders, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Number of components. Embeddings are only comparable at equal dimension.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
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

    /// L2-normalize in place. Zero vectors are left untouched.
    pub fn normalize(&mut self) {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
    }
}

/// Which embedder in the fallback chain produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorSource {
    Primary,
    Fallback,
}

/// One detected face in one frame. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub region: BoundingBox,
    pub embedding: Embedding,
    /// Detector confidence in [0, 1].
    pub detector_confidence: f32,
    pub detector_source: DetectorSource,
}

/// A single enrollment frame's embedding plus an optional quality indicator
/// (sharpness, detector confidence, ...). Lives for one enrollment session.
#[derive(Debug, Clone)]
pub struct EnrollmentSample {
    pub embedding: Embedding,
    pub quality: Option<f32>,
}

impl EnrollmentSample {
    pub fn new(embedding: Embedding) -> Self {
        Self {
            embedding,
            quality: None,
        }
    }

    pub fn with_quality(embedding: Embedding, quality: f32) -> Self {
        Self {
            embedding,
            quality: Some(quality),
        }
    }
}

impl From<DetectionResult> for EnrollmentSample {
    fn from(detection: DetectionResult) -> Self {
        Self::with_quality(detection.embedding, detection.detector_confidence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Unknown,
}

/// Outcome of matching one query embedding against the gallery.
///
/// The candidate fields stay populated on `Unknown` whenever the gallery
/// was non-empty, so callers can report the closest identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDecision {
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    pub distance: f32,
    pub cosine_similarity: f32,
    pub confidence: f32,
    /// Tolerance the distance was compared against after scene adjustment.
    pub effective_tolerance: f32,
    pub verdict: Verdict,
}

impl MatchDecision {
    /// Decision for an empty gallery: nothing to compare against.
    pub fn empty(effective_tolerance: f32) -> Self {
        Self {
            identity_id: None,
            display_name: None,
            distance: f32::INFINITY,
            cosine_similarity: 0.0,
            confidence: 0.0,
            effective_tolerance,
            verdict: Verdict::Unknown,
        }
    }

    pub fn is_match(&self) -> bool {
        self.verdict == Verdict::Match
    }
}

/// One scored gallery entry, as produced by ranking.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub identity_id: String,
    pub display_name: String,
    pub distance: f32,
    pub cosine_similarity: f32,
    pub confidence: f32,
}
