//! Nearest-identity search with adaptive tolerance and dual-metric
//! verification.
//!
//! Pipeline for one query:
//!
//! 1. Euclidean scan over the whole gallery, keeping the closest identity
//!    (ties go to the earliest inserted).
//! 2. Effective tolerance = base tolerance scaled by the scene variance
//!    signal, when one is supplied.
//! 3. Within tolerance, cosine similarity must also clear `min_cosine`.
//! 4. `confidence = clamp(1 - distance / tolerance, 0, 1) * quality_score`
//!    must exceed `min_confidence`.
//!
//! Anything short of a full pass yields `Verdict::Unknown` with the
//! closest-candidate fields still filled in.

use crate::gallery::{Gallery, Identity};
use crate::types::{Candidate, Embedding, MatchDecision, Verdict};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_TOLERANCE: f32 = 0.1;
pub const MAX_TOLERANCE: f32 = 1.0;

/// Scene variance at which the tolerance adjustment saturates.
const SCENE_VARIANCE_SCALE: f32 = 1000.0;
/// Tolerance multiplier for a perfectly flat scene.
const FLAT_SCENE_FACTOR: f32 = 1.2;
/// Span between the flat-scene and busy-scene multipliers (1.2 → 0.8).
const SCENE_FACTOR_SPAN: f32 = 0.4;
/// Relaxed re-query widens tolerance by this factor.
const RELAXED_TOLERANCE_FACTOR: f32 = 1.5;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("query dimension {query} does not match gallery dimension {gallery} (identity {identity_id})")]
    DimensionMismatch {
        query: usize,
        gallery: usize,
        identity_id: String,
    },
    #[error("query embedding has non-finite components")]
    NonFiniteQuery,
}

/// Matcher thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Euclidean acceptance distance before scene adjustment.
    pub base_tolerance: f32,
    /// Cosine similarity the best candidate must strictly exceed.
    pub min_cosine: f32,
    /// Confidence a match must exceed.
    pub min_confidence: f32,
    /// Confidence a relaxed re-query must exceed.
    pub requery_min_confidence: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            base_tolerance: 0.5,
            min_cosine: 0.5,
            min_confidence: 0.3,
            requery_min_confidence: 0.6,
        }
    }
}

impl MatchConfig {
    /// Set the base tolerance, clamped into [`MIN_TOLERANCE`, `MAX_TOLERANCE`].
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.base_tolerance = clamp_tolerance(tolerance);
        self
    }
}

pub fn clamp_tolerance(tolerance: f32) -> f32 {
    if tolerance.is_nan() {
        return MatchConfig::default().base_tolerance;
    }
    tolerance.clamp(MIN_TOLERANCE, MAX_TOLERANCE)
}

/// Scale `base` by the scene variance signal: flat scenes widen the
/// tolerance (up to ×1.2), busy scenes narrow it (down to ×0.8).
/// `None` leaves `base` unchanged.
pub fn adaptive_tolerance(base: f32, scene_variance: Option<f32>) -> f32 {
    match scene_variance {
        Some(v) if v.is_finite() => {
            let level = (v.max(0.0) / SCENE_VARIANCE_SCALE).min(1.0);
            base * (FLAT_SCENE_FACTOR - SCENE_FACTOR_SPAN * level)
        }
        _ => base,
    }
}

/// Matches query embeddings against a gallery snapshot. Stateless apart
/// from its thresholds, so one engine can serve any number of threads.
#[derive(Debug, Clone, Default)]
pub struct MatchEngine {
    config: MatchConfig,
}

impl MatchEngine {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Match one query against the gallery at the configured base tolerance.
    pub fn match_query(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        scene_variance: Option<f32>,
    ) -> Result<MatchDecision, MatchError> {
        self.match_with_tolerance(
            query,
            gallery,
            self.config.base_tolerance,
            scene_variance,
            self.config.min_confidence,
        )
    }

    /// Match one query with an explicit base tolerance.
    pub fn match_with_tolerance(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        base_tolerance: f32,
        scene_variance: Option<f32>,
        min_confidence: f32,
    ) -> Result<MatchDecision, MatchError> {
        let tolerance = adaptive_tolerance(base_tolerance, scene_variance);

        if !query.is_finite() {
            return Err(MatchError::NonFiniteQuery);
        }
        if gallery.is_empty() {
            return Ok(MatchDecision::empty(tolerance));
        }
        check_dimensions(query, gallery)?;

        // Always scan every entry; strict `<` keeps the earliest on ties.
        let mut best: Option<(&Identity, f32)> = None;
        for identity in gallery {
            let distance = query.euclidean_distance(&identity.canonical_encoding);
            match best {
                Some((_, d)) if distance >= d => {}
                _ => best = Some((identity, distance)),
            }
        }

        let Some((identity, distance)) = best else {
            return Ok(MatchDecision::empty(tolerance));
        };

        let cosine = query.similarity(&identity.canonical_encoding);
        let confidence = confidence(distance, tolerance, identity.quality_score);

        let within_tolerance = distance <= tolerance;
        let cosine_ok = cosine > self.config.min_cosine;
        let confident = confidence > min_confidence;

        let verdict = if within_tolerance && cosine_ok && confident {
            Verdict::Match
        } else {
            Verdict::Unknown
        };

        if within_tolerance && !cosine_ok {
            tracing::debug!(
                identity = %identity.id,
                distance,
                cosine,
                min_cosine = self.config.min_cosine,
                "distance passed but cosine verification failed"
            );
        }

        tracing::trace!(
            identity = %identity.id,
            distance,
            cosine,
            confidence,
            tolerance,
            ?verdict,
            "match decision"
        );

        Ok(MatchDecision {
            identity_id: Some(identity.id.clone()),
            display_name: Some(identity.display_name.clone()),
            distance,
            cosine_similarity: cosine,
            confidence,
            effective_tolerance: tolerance,
            verdict,
        })
    }

    /// Match every face found in one frame independently.
    pub fn match_all(
        &self,
        queries: &[Embedding],
        gallery: &Gallery,
        scene_variance: Option<f32>,
    ) -> Result<Vec<MatchDecision>, MatchError> {
        queries
            .iter()
            .map(|q| self.match_query(q, gallery, scene_variance))
            .collect()
    }

    /// Retry an uncertain query at 1.5× tolerance.
    ///
    /// The relaxed pass only counts as a match when its confidence exceeds
    /// `requery_min_confidence`; otherwise its decision is returned as
    /// `Unknown`.
    pub fn rematch_relaxed(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        scene_variance: Option<f32>,
    ) -> Result<MatchDecision, MatchError> {
        let relaxed = self.config.base_tolerance * RELAXED_TOLERANCE_FACTOR;
        self.match_with_tolerance(
            query,
            gallery,
            relaxed,
            scene_variance,
            self.config.requery_min_confidence,
        )
    }

    /// Score every identity and order by distance (ties by insertion order).
    pub fn rank(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        scene_variance: Option<f32>,
    ) -> Result<Vec<Candidate>, MatchError> {
        if !query.is_finite() {
            return Err(MatchError::NonFiniteQuery);
        }
        if gallery.is_empty() {
            return Ok(Vec::new());
        }
        check_dimensions(query, gallery)?;

        let tolerance = adaptive_tolerance(self.config.base_tolerance, scene_variance);
        let mut candidates: Vec<Candidate> = gallery
            .iter()
            .map(|identity| {
                let distance = query.euclidean_distance(&identity.canonical_encoding);
                Candidate {
                    identity_id: identity.id.clone(),
                    display_name: identity.display_name.clone(),
                    distance,
                    cosine_similarity: query.similarity(&identity.canonical_encoding),
                    confidence: confidence(distance, tolerance, identity.quality_score),
                }
            })
            .collect();

        // Stable sort keeps insertion order for equal distances.
        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }
}

fn confidence(distance: f32, tolerance: f32, quality_score: f32) -> f32 {
    if tolerance <= 0.0 {
        return 0.0;
    }
    (1.0 - distance / tolerance).clamp(0.0, 1.0) * quality_score.clamp(0.0, 1.0)
}

fn check_dimensions(query: &Embedding, gallery: &Gallery) -> Result<(), MatchError> {
    match gallery
        .iter()
        .find(|i| i.dimension() != query.dimension())
    {
        Some(identity) => Err(MatchError::DimensionMismatch {
            query: query.dimension(),
            gallery: identity.dimension(),
            identity_id: identity.id.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::{aggregate, Enrollment};
    use crate::types::EnrollmentSample;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn identity(id: &str, values: Vec<f32>, quality: f32) -> Identity {
        Identity::with_id(
            id,
            id.to_uppercase(),
            Enrollment {
                encoding: Embedding::new(values),
                quality_score: quality,
                samples_used: 1,
            },
        )
    }

    fn engine() -> MatchEngine {
        MatchEngine::new(MatchConfig::default())
    }

    #[test]
    fn test_exact_match() {
        let values: Vec<f32> = (0..128).map(|i| (i as f32 * 0.1).cos() * 0.1).collect();
        let gallery = Gallery::from_identities(vec![
            identity("other", values.iter().map(|v| -v).collect(), 0.9),
            identity("self", values.clone(), 0.9),
        ]);

        let d = engine()
            .match_query(&Embedding::new(values), &gallery, None)
            .unwrap();
        assert_eq!(d.verdict, Verdict::Match);
        assert_eq!(d.identity_id.as_deref(), Some("self"));
        assert_eq!(d.display_name.as_deref(), Some("SELF"));
        assert!(d.distance.abs() < 1e-6);
        assert!((d.cosine_similarity - 1.0).abs() < 1e-5);
        assert!((d.confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_exact_match_any_embedding() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let values: Vec<f32> = (0..512).map(|_| rng.gen_range(-0.1..0.1)).collect();
            let quality = rng.gen_range(0.4..1.0);
            let gallery = Gallery::from_identities(vec![identity("x", values.clone(), quality)]);
            let d = engine()
                .match_query(&Embedding::new(values), &gallery, None)
                .unwrap();
            assert!(d.is_match());
            assert!(d.distance < 1e-6);
            assert!((d.confidence - quality).abs() < 1e-5);
        }
    }

    #[test]
    fn test_empty_gallery_unknown() {
        let d = engine()
            .match_query(&Embedding::new(vec![1.0, 2.0]), &Gallery::new(), Some(500.0))
            .unwrap();
        assert_eq!(d.verdict, Verdict::Unknown);
        assert!(d.identity_id.is_none());
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let gallery = Gallery::from_identities(vec![identity("a", vec![1.0, 0.0, 0.0], 1.0)]);
        let err = engine()
            .match_query(&Embedding::new(vec![1.0, 0.0]), &gallery, None)
            .unwrap_err();
        assert_eq!(
            err,
            MatchError::DimensionMismatch { query: 2, gallery: 3, identity_id: "a".into() }
        );
    }

    #[test]
    fn test_out_of_tolerance_keeps_diagnostics() {
        let gallery = Gallery::from_identities(vec![identity("a", vec![1.0, 0.0], 1.0)]);
        let d = engine()
            .match_query(&Embedding::new(vec![0.0, 1.0]), &gallery, None)
            .unwrap();
        assert_eq!(d.verdict, Verdict::Unknown);
        assert_eq!(d.identity_id.as_deref(), Some("a"));
        assert!((d.distance - 2f32.sqrt()).abs() < 1e-6);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_cosine_verification_rejects_within_tolerance() {
        // Tiny vectors: close in Euclidean terms but pointing apart.
        let gallery = Gallery::from_identities(vec![identity("a", vec![0.05, 0.0], 1.0)]);
        let d = engine()
            .match_query(&Embedding::new(vec![0.0, 0.05]), &gallery, None)
            .unwrap();
        assert!(d.distance < 0.5);
        assert!(d.cosine_similarity.abs() < 1e-6);
        assert!(d.confidence > 0.8);
        assert_eq!(d.verdict, Verdict::Unknown);
    }

    #[test]
    fn test_confidence_floor() {
        let gallery = Gallery::from_identities(vec![identity("a", vec![1.0, 0.0], 0.2)]);
        let d = engine()
            .match_query(&Embedding::new(vec![1.0, 0.0]), &gallery, None)
            .unwrap();
        assert!((d.confidence - 0.2).abs() < 1e-6);
        assert_eq!(d.verdict, Verdict::Unknown);
        assert_eq!(d.identity_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_tie_goes_to_earliest() {
        let gallery = Gallery::from_identities(vec![
            identity("first", vec![1.0, 0.0], 1.0),
            identity("second", vec![1.0, 0.0], 1.0),
        ]);
        let d = engine()
            .match_query(&Embedding::new(vec![1.0, 0.1]), &gallery, None)
            .unwrap();
        assert_eq!(d.identity_id.as_deref(), Some("first"));

        let ranked = engine()
            .rank(&Embedding::new(vec![1.0, 0.1]), &gallery, None)
            .unwrap();
        assert_eq!(ranked[0].identity_id, "first");
        assert_eq!(ranked[1].identity_id, "second");
    }

    #[test]
    fn test_adaptive_tolerance() {
        assert_eq!(adaptive_tolerance(0.5, None), 0.5);
        assert!((adaptive_tolerance(0.5, Some(0.0)) - 0.6).abs() < 1e-6);
        assert!((adaptive_tolerance(0.5, Some(500.0)) - 0.5).abs() < 1e-6);
        assert!((adaptive_tolerance(0.5, Some(1000.0)) - 0.4).abs() < 1e-6);
        assert!((adaptive_tolerance(0.5, Some(50_000.0)) - 0.4).abs() < 1e-6);
        assert_eq!(adaptive_tolerance(0.5, Some(f32::NAN)), 0.5);
    }

    #[test]
    fn test_flat_scene_accepts_borderline() {
        // Distance 0.55 is outside 0.5 but inside the flat-scene 0.6.
        let gallery = Gallery::from_identities(vec![identity("a", vec![1.0, 0.0], 1.0)]);
        let query = Embedding::new(vec![1.55, 0.0]);
        let cfg = MatchConfig { min_confidence: 0.0, ..Default::default() };
        let eng = MatchEngine::new(cfg);

        assert_eq!(eng.match_query(&query, &gallery, None).unwrap().verdict, Verdict::Unknown);
        assert_eq!(
            eng.match_query(&query, &gallery, Some(0.0)).unwrap().verdict,
            Verdict::Match
        );
        assert_eq!(
            eng.match_query(&query, &gallery, Some(2000.0)).unwrap().verdict,
            Verdict::Unknown
        );
    }

    #[test]
    fn test_tolerance_clamp() {
        assert_eq!(MatchConfig::default().with_tolerance(5.0).base_tolerance, MAX_TOLERANCE);
        assert_eq!(MatchConfig::default().with_tolerance(0.0).base_tolerance, MIN_TOLERANCE);
        assert_eq!(MatchConfig::default().with_tolerance(0.45).base_tolerance, 0.45);
    }

    #[test]
    fn test_rematch_relaxed() {
        // Distance 0.6: outside 0.5, inside relaxed 0.75 with confidence 0.2.
        let gallery = Gallery::from_identities(vec![identity("a", vec![1.0, 0.0], 1.0)]);
        let query = Embedding::new(vec![1.6, 0.0]);
        let eng = engine();

        let relaxed = eng.rematch_relaxed(&query, &gallery, None).unwrap();
        assert!((relaxed.effective_tolerance - 0.75).abs() < 1e-6);
        assert!((relaxed.confidence - 0.2).abs() < 1e-5);
        assert_eq!(relaxed.verdict, Verdict::Unknown);

        // Distance 0.1 under relaxed tolerance: confidence ≈ 0.867 > 0.6.
        let near = Embedding::new(vec![1.1, 0.0]);
        assert!(eng.rematch_relaxed(&near, &gallery, None).unwrap().is_match());
    }

    #[test]
    fn test_match_all() {
        let gallery = Gallery::from_identities(vec![
            identity("a", vec![1.0, 0.0], 1.0),
            identity("b", vec![0.0, 1.0], 1.0),
        ]);
        let decisions = engine()
            .match_all(
                &[Embedding::new(vec![0.0, 1.0]), Embedding::new(vec![1.0, 0.0])],
                &gallery,
                None,
            )
            .unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].identity_id.as_deref(), Some("b"));
        assert_eq!(decisions[1].identity_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_consistent_enrollment_ranks_above_scattered() {
        let dim = 128;
        let v: Vec<f32> = (0..dim).map(|i| (i as f32 * 0.37).sin() * 0.1).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let mut samples = |spread: f32| -> Vec<EnrollmentSample> {
            (0..15)
                .map(|_| {
                    let values = v.iter().map(|c| c + rng.gen_range(-spread..spread)).collect();
                    EnrollmentSample::new(Embedding::new(values))
                })
                .collect()
        };

        let tight = aggregate(&samples(0.005), 11, 15).unwrap();
        let loose = aggregate(&samples(0.2), 11, 15).unwrap();
        assert!(tight.quality_score > 0.8);
        assert!(loose.quality_score < 0.4);

        // Same canonical vector, only quality differs: distances are equal.
        let a = Identity::with_id("A", "A", Enrollment { encoding: Embedding::new(v.clone()), ..tight.clone() });
        let b = Identity::with_id("B", "B", Enrollment { encoding: Embedding::new(v.clone()), ..loose.clone() });
        let gallery = Gallery::from_identities(vec![b, a]);
        let ranked = engine().rank(&Embedding::new(v.clone()), &gallery, None).unwrap();
        let conf = |id: &str| ranked.iter().find(|c| c.identity_id == id).unwrap().confidence;
        assert!(conf("A") > conf("B"));

        // With the aggregated encodings as enrolled.
        let gallery = Gallery::from_identities(vec![
            Identity::with_id("A", "A", tight),
            Identity::with_id("B", "B", loose),
        ]);
        let ranked = engine().rank(&Embedding::new(v), &gallery, None).unwrap();
        let conf = |id: &str| ranked.iter().find(|c| c.identity_id == id).unwrap().confidence;
        assert!(conf("A") > conf("B"));
    }

    #[test]
    fn test_confidence_must_exceed_floor() {
        // Distance 0.375 at tolerance 0.5 gives confidence 0.25 exactly.
        let gallery = Gallery::from_identities(vec![identity("a", vec![1.0, 0.0], 1.0)]);
        let query = Embedding::new(vec![1.375, 0.0]);
        let at_floor = MatchEngine::new(MatchConfig {
            min_confidence: 0.25,
            ..Default::default()
        })
        .match_query(&query, &gallery, None)
        .unwrap();
        assert!((at_floor.confidence - 0.25).abs() < 1e-6);
        assert_eq!(at_floor.verdict, Verdict::Unknown);

        let below = MatchEngine::new(MatchConfig {
            min_confidence: 0.2,
            ..Default::default()
        })
        .match_query(&query, &gallery, None)
        .unwrap();
        assert_eq!(below.verdict, Verdict::Match);
    }

    #[test]
    fn test_non_finite_query_rejected() {
        let gallery = Gallery::from_identities(vec![
            identity("first", vec![1.0, 0.0], 1.0),
            identity("second", vec![0.0, 1.0], 1.0),
        ]);
        let query = Embedding::new(vec![f32::NAN, 0.0]);
        assert_eq!(
            engine().match_query(&query, &gallery, None).unwrap_err(),
            MatchError::NonFiniteQuery
        );
        assert_eq!(
            engine().rank(&query, &gallery, None).unwrap_err(),
            MatchError::NonFiniteQuery
        );
        let inf = Embedding::new(vec![f32::INFINITY, 0.0]);
        assert_eq!(
            engine().match_query(&inf, &Gallery::new(), None).unwrap_err(),
            MatchError::NonFiniteQuery
        );
    }

    #[test]
    fn test_rank_empty() {
        assert!(engine()
            .rank(&Embedding::new(vec![1.0]), &Gallery::new(), None)
            .unwrap()
            .is_empty());
    }
}
