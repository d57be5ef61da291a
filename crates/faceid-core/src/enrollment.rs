//! Enrollment aggregation: many per-frame embeddings of one person in,
//! one canonical encoding and a quality score out.
//!
//! The quality score blends two signals:
//!
//! - capture ratio: how many of the requested frames produced a usable sample
//! - consistency: how tightly the samples cluster, measured as total
//!   coordinate variance relative to the mean squared sample norm
//!
//! Scattered enrollments get a low score, and the matcher scales its
//! confidence by that score, so a poor enrollment under-performs at match
//! time instead of failing later in a way nobody can explain.

use crate::types::{Embedding, EnrollmentSample};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Slope of the consistency curve: `1 / (1 + gain * dispersion)`.
const DISPERSION_GAIN: f32 = 10.0;
/// Share of the quality score that does not depend on capture ratio.
const CAPTURE_FLOOR: f32 = 0.5;

#[derive(Error, Debug, PartialEq)]
pub enum EnrollmentError {
    #[error("insufficient samples: {usable} usable, {required} required")]
    InsufficientSamples { usable: usize, required: usize },
    #[error("sample dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("enrollment quality {quality:.3} below minimum {minimum:.3}")]
    QualityTooLow { quality: f32, minimum: f32 },
}

/// Aggregated enrollment result, ready to be committed as an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub encoding: Embedding,
    pub quality_score: f32,
    pub samples_used: usize,
}

/// Capture policy for one enrollment session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentPolicy {
    /// Number of frames the session asks the camera/embedder for.
    pub requested_frames: usize,
    /// Fraction of requested frames that must yield a usable sample.
    pub min_capture_ratio: f32,
    /// Enrollments scoring below this are rejected outright.
    pub min_quality: f32,
    /// Samples whose own quality indicator is below this are ignored.
    pub min_sample_quality: f32,
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        Self {
            requested_frames: 15,
            min_capture_ratio: 0.7,
            min_quality: 0.0,
            min_sample_quality: 0.0,
        }
    }
}

impl EnrollmentPolicy {
    /// `ceil(requested_frames * min_capture_ratio)`, never below one.
    pub fn min_samples(&self) -> usize {
        let required = (self.requested_frames as f32 * self.min_capture_ratio).ceil() as usize;
        required.max(1)
    }
}

/// Policy-driven wrapper around [`aggregate`].
#[derive(Debug, Clone, Default)]
pub struct EnrollmentAggregator {
    policy: EnrollmentPolicy,
}

impl EnrollmentAggregator {
    pub fn new(policy: EnrollmentPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EnrollmentPolicy {
        &self.policy
    }

    /// Aggregate one session's samples under this policy.
    pub fn aggregate(&self, samples: &[EnrollmentSample]) -> Result<Enrollment, EnrollmentError> {
        let usable: Vec<&EnrollmentSample> = samples
            .iter()
            .filter(|s| is_usable(s, self.policy.min_sample_quality))
            .collect();

        let enrollment = aggregate_usable(
            &usable,
            self.policy.min_samples(),
            self.policy.requested_frames,
        )?;

        if enrollment.quality_score < self.policy.min_quality {
            tracing::warn!(
                quality = enrollment.quality_score,
                minimum = self.policy.min_quality,
                "enrollment rejected: quality below minimum"
            );
            return Err(EnrollmentError::QualityTooLow {
                quality: enrollment.quality_score,
                minimum: self.policy.min_quality,
            });
        }

        Ok(enrollment)
    }
}

/// Aggregate samples into a canonical encoding.
///
/// `min_samples` is the usable-sample floor; `requested_frames` is what the
/// session asked for and drives the capture-ratio half of the quality score.
/// Samples with non-finite values are not usable. The result does not
/// depend on sample order.
pub fn aggregate(
    samples: &[EnrollmentSample],
    min_samples: usize,
    requested_frames: usize,
) -> Result<Enrollment, EnrollmentError> {
    let usable: Vec<&EnrollmentSample> = samples.iter().filter(|s| is_usable(s, 0.0)).collect();
    aggregate_usable(&usable, min_samples, requested_frames)
}

fn is_usable(sample: &EnrollmentSample, min_sample_quality: f32) -> bool {
    !sample.embedding.values.is_empty()
        && sample.embedding.is_finite()
        && sample.quality.map_or(true, |q| q >= min_sample_quality)
}

fn aggregate_usable(
    usable: &[&EnrollmentSample],
    min_samples: usize,
    requested_frames: usize,
) -> Result<Enrollment, EnrollmentError> {
    let required = min_samples.max(1);
    if usable.len() < required {
        tracing::debug!(usable = usable.len(), required, "enrollment: insufficient samples");
        return Err(EnrollmentError::InsufficientSamples {
            usable: usable.len(),
            required,
        });
    }

    let dim = usable[0].embedding.dimension();
    if let Some(bad) = usable.iter().find(|s| s.embedding.dimension() != dim) {
        return Err(EnrollmentError::DimensionMismatch {
            expected: dim,
            actual: bad.embedding.dimension(),
        });
    }

    // Accumulate in f64 so the mean is insensitive to sample order.
    let n = usable.len() as f64;
    let mut mean = vec![0.0f64; dim];
    for sample in usable {
        for (m, &v) in mean.iter_mut().zip(&sample.embedding.values) {
            *m += v as f64;
        }
    }
    for m in &mut mean {
        *m /= n;
    }

    // Total variance = mean squared distance to the centroid.
    let mut total_variance = 0.0f64;
    let mut mean_sq_norm = 0.0f64;
    for sample in usable {
        for (m, &v) in mean.iter().zip(&sample.embedding.values) {
            let v = v as f64;
            total_variance += (v - m).powi(2);
            mean_sq_norm += v * v;
        }
    }
    total_variance /= n;
    mean_sq_norm /= n;

    let dispersion = if mean_sq_norm > 0.0 {
        (total_variance / mean_sq_norm) as f32
    } else {
        0.0
    };
    let consistency = 1.0 / (1.0 + DISPERSION_GAIN * dispersion);

    let capture = if requested_frames == 0 {
        1.0
    } else {
        (usable.len() as f32 / requested_frames as f32).min(1.0)
    };

    let quality_score =
        (consistency * (CAPTURE_FLOOR + (1.0 - CAPTURE_FLOOR) * capture)).clamp(0.0, 1.0);

    tracing::debug!(
        samples = usable.len(),
        requested_frames,
        dispersion,
        consistency,
        capture,
        quality_score,
        "enrollment aggregated"
    );

    Ok(Enrollment {
        encoding: Embedding {
            values: mean.into_iter().map(|m| m as f32).collect(),
            model_version: usable[0].embedding.model_version.clone(),
        },
        quality_score,
        samples_used: usable.len(),
    })
}
