//! Enrolled identities and the in-memory gallery they live in.

use crate::enrollment::Enrollment;
use crate::types::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Why an identity cannot be stored as-is.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidIdentity {
    #[error("canonical encoding is empty")]
    EmptyEncoding,
    #[error("canonical encoding has non-finite components")]
    NonFiniteEncoding,
    #[error("quality score {0} is outside [0, 1]")]
    QualityOutOfRange(f32),
}

/// An enrolled person.
///
/// `integrity_hash` always covers `display_name` + `canonical_encoding`;
/// it is recomputed whenever either changes through [`Identity::new`] or
/// [`Identity::reenroll`].
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub canonical_encoding: Embedding,
    pub quality_score: f32,
    pub integrity_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Create a new identity with a fresh random id.
    pub fn new(display_name: impl Into<String>, enrollment: Enrollment) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), display_name, enrollment)
    }

    /// Create an identity under a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        display_name: impl Into<String>,
        enrollment: Enrollment,
    ) -> Self {
        let display_name = display_name.into();
        let integrity_hash = integrity_hash(&display_name, &enrollment.encoding);
        Self {
            id: id.into(),
            display_name,
            canonical_encoding: enrollment.encoding,
            quality_score: enrollment.quality_score,
            integrity_hash,
            created_at: Utc::now(),
        }
    }

    /// Replace the encoding and quality from a fresh enrollment. The id and
    /// creation time are kept.
    pub fn reenroll(&mut self, enrollment: Enrollment) {
        self.canonical_encoding = enrollment.encoding;
        self.quality_score = enrollment.quality_score;
        self.rehash();
    }

    pub fn rehash(&mut self) {
        self.integrity_hash = integrity_hash(&self.display_name, &self.canonical_encoding);
    }

    pub fn verify_integrity(&self) -> bool {
        integrity_hash(&self.display_name, &self.canonical_encoding) == self.integrity_hash
    }

    pub fn dimension(&self) -> usize {
        self.canonical_encoding.dimension()
    }

    /// Check the value invariants: a non-empty finite encoding and a
    /// quality score in [0, 1].
    pub fn validate(&self) -> Result<(), InvalidIdentity> {
        if self.canonical_encoding.values.is_empty() {
            return Err(InvalidIdentity::EmptyEncoding);
        }
        if !self.canonical_encoding.is_finite() {
            return Err(InvalidIdentity::NonFiniteEncoding);
        }
        if !(0.0..=1.0).contains(&self.quality_score) {
            return Err(InvalidIdentity::QualityOutOfRange(self.quality_score));
        }
        Ok(())
    }
}

/// SHA-256 over the display name, a zero separator, then every encoding
/// component as little-endian `f32` bytes. Lowercase hex.
pub fn integrity_hash(display_name: &str, encoding: &Embedding) -> String {
    let mut hasher = Sha256::new();
    hasher.update(display_name.as_bytes());
    hasher.update([0u8]);
    for v in &encoding.values {
        hasher.update(v.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ViolationReason {
    /// Stored hash differs from the recomputed one.
    HashMismatch,
    /// Hash matches but the values break an invariant.
    InvalidValues(String),
    /// The record could not be decoded at all.
    Unreadable(String),
    /// Another record earlier in the same document uses this id.
    DuplicateId,
}

impl std::fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HashMismatch => f.write_str("integrity hash mismatch"),
            Self::InvalidValues(detail) => write!(f, "invalid values: {detail}"),
            Self::Unreadable(detail) => write!(f, "unreadable record: {detail}"),
            Self::DuplicateId => f.write_str("duplicate id"),
        }
    }
}

/// A persisted identity whose stored hash no longer matches its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityViolation {
    pub identity_id: String,
    pub display_name: String,
    pub stored_hash: String,
    pub computed_hash: String,
    pub reason: ViolationReason,
}

impl IntegrityViolation {
    /// Hash check only.
    pub fn check(identity: &Identity) -> Option<Self> {
        let computed = integrity_hash(&identity.display_name, &identity.canonical_encoding);
        if computed == identity.integrity_hash {
            return None;
        }
        Some(Self::of(identity, computed, ViolationReason::HashMismatch))
    }

    /// Hash check, then the value invariants of [`Identity::validate`].
    pub fn inspect(identity: &Identity) -> Option<Self> {
        if let Some(violation) = Self::check(identity) {
            return Some(violation);
        }
        let invalid = identity.validate().err()?;
        Some(Self::of(
            identity,
            identity.integrity_hash.clone(),
            ViolationReason::InvalidValues(invalid.to_string()),
        ))
    }

    pub fn duplicate(identity: &Identity) -> Self {
        Self::of(identity, identity.integrity_hash.clone(), ViolationReason::DuplicateId)
    }

    /// A record that could not be decoded into an [`Identity`]; whatever
    /// fields were readable are carried over.
    pub fn unreadable(
        identity_id: impl Into<String>,
        display_name: impl Into<String>,
        stored_hash: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            identity_id: identity_id.into(),
            display_name: display_name.into(),
            stored_hash: stored_hash.into(),
            computed_hash: String::new(),
            reason: ViolationReason::Unreadable(error.into()),
        }
    }

    fn of(identity: &Identity, computed_hash: String, reason: ViolationReason) -> Self {
        Self {
            identity_id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            stored_hash: identity.integrity_hash.clone(),
            computed_hash,
            reason,
        }
    }
}

/// Insertion-ordered set of identities keyed by id.
///
/// Display names are not required to be unique. Order is stable across
/// a save/load cycle, which keeps matcher tie-breaking deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    identities: Vec<Identity>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_identities(identities: Vec<Identity>) -> Self {
        let mut gallery = Self::new();
        for identity in identities {
            gallery.upsert(identity);
        }
        gallery
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Identity> {
        self.identities.iter()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Shared embedding dimension, or `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.identities.first().map(Identity::dimension)
    }

    /// Insert, or replace in place (keeping position) when the id exists.
    /// Returns the replaced identity.
    pub fn upsert(&mut self, identity: Identity) -> Option<Identity> {
        match self.identities.iter_mut().find(|i| i.id == identity.id) {
            Some(slot) => Some(std::mem::replace(slot, identity)),
            None => {
                self.identities.push(identity);
                None
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Identity> {
        let pos = self.identities.iter().position(|i| i.id == id)?;
        Some(self.identities.remove(pos))
    }

    /// Mean quality score, 0.0 when empty.
    pub fn average_quality(&self) -> f32 {
        if self.identities.is_empty() {
            return 0.0;
        }
        self.identities.iter().map(|i| i.quality_score).sum::<f32>()
            / self.identities.len() as f32
    }
}

impl<'a> IntoIterator for &'a Gallery {
    type Item = &'a Identity;
    type IntoIter = std::slice::Iter<'a, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.identities.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment(values: Vec<f32>, quality: f32) -> Enrollment {
        Enrollment {
            encoding: Embedding::new(values),
            quality_score: quality,
            samples_used: 1,
        }
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let e = Embedding::new(vec![0.1, -0.2, 0.3]);
        let a = integrity_hash("alice", &e);
        let b = integrity_hash("alice", &e);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hash_covers_name_and_encoding() {
        let e = Embedding::new(vec![0.1, -0.2, 0.3]);
        let base = integrity_hash("alice", &e);
        assert_ne!(base, integrity_hash("alicf", &e));
        assert_ne!(base, integrity_hash("alice", &Embedding::new(vec![0.1, -0.2, 0.30001])));
    }

    #[test]
    fn test_new_identity_verifies() {
        let identity = Identity::new("alice", enrollment(vec![1.0, 2.0], 0.9));
        assert!(identity.verify_integrity());
        assert!(IntegrityViolation::check(&identity).is_none());
        assert_eq!(identity.dimension(), 2);
    }

    #[test]
    fn test_tampered_identity_reports_violation() {
        let mut identity = Identity::new("alice", enrollment(vec![1.0, 2.0], 0.9));
        identity.canonical_encoding.values[0] = 5.0;
        let violation = IntegrityViolation::check(&identity).unwrap();
        assert_eq!(violation.identity_id, identity.id);
        assert_ne!(violation.stored_hash, violation.computed_hash);
        assert_eq!(violation.reason, ViolationReason::HashMismatch);
    }

    #[test]
    fn test_validate() {
        assert!(Identity::new("a", enrollment(vec![1.0], 0.0)).validate().is_ok());
        assert!(Identity::new("a", enrollment(vec![1.0], 1.0)).validate().is_ok());
        assert_eq!(
            Identity::new("a", enrollment(vec![], 0.5)).validate(),
            Err(InvalidIdentity::EmptyEncoding)
        );
        assert_eq!(
            Identity::new("a", enrollment(vec![1.0, f32::NAN], 0.5)).validate(),
            Err(InvalidIdentity::NonFiniteEncoding)
        );
        assert_eq!(
            Identity::new("a", enrollment(vec![1.0], 7.5)).validate(),
            Err(InvalidIdentity::QualityOutOfRange(7.5))
        );
        assert!(matches!(
            Identity::new("a", enrollment(vec![1.0], f32::NAN)).validate(),
            Err(InvalidIdentity::QualityOutOfRange(q)) if q.is_nan()
        ));
    }

    #[test]
    fn test_inspect_reports_invalid_values() {
        let identity = Identity::new("alice", enrollment(vec![1.0, 2.0], 1.5));
        assert!(IntegrityViolation::check(&identity).is_none());
        let violation = IntegrityViolation::inspect(&identity).unwrap();
        assert!(matches!(violation.reason, ViolationReason::InvalidValues(_)));
        assert_eq!(violation.stored_hash, violation.computed_hash);
    }

    #[test]
    fn test_violation_reason_json() {
        let json = serde_json::to_value(ViolationReason::Unreadable("bad".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "unreadable", "detail": "bad"}));
        let json = serde_json::to_value(ViolationReason::DuplicateId).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "duplicate_id"}));
        assert_eq!(ViolationReason::HashMismatch.to_string(), "integrity hash mismatch");
    }

    #[test]
    fn test_reenroll_keeps_id_and_rehashes() {
        let mut identity = Identity::new("alice", enrollment(vec![1.0, 2.0], 0.9));
        let id = identity.id.clone();
        let created = identity.created_at;
        let old_hash = identity.integrity_hash.clone();

        identity.reenroll(enrollment(vec![3.0, 4.0], 0.5));
        assert_eq!(identity.id, id);
        assert_eq!(identity.created_at, created);
        assert_ne!(identity.integrity_hash, old_hash);
        assert!(identity.verify_integrity());
        assert_eq!(identity.quality_score, 0.5);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let a = Identity::with_id("a", "alice", enrollment(vec![1.0], 0.9));
        let b = Identity::with_id("b", "bob", enrollment(vec![2.0], 0.9));
        let mut gallery = Gallery::from_identities(vec![a, b]);

        let replaced = gallery.upsert(Identity::with_id("a", "alice2", enrollment(vec![3.0], 0.8)));
        assert_eq!(replaced.map(|i| i.display_name), Some("alice".to_string()));
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.identities()[0].display_name, "alice2");
        assert_eq!(gallery.identities()[1].id, "b");
    }

    #[test]
    fn test_remove_and_dimension() {
        let mut gallery = Gallery::new();
        assert_eq!(gallery.dimension(), None);
        gallery.upsert(Identity::with_id("a", "alice", enrollment(vec![1.0, 0.0, 0.0], 0.6)));
        gallery.upsert(Identity::with_id("b", "bob", enrollment(vec![0.0, 1.0, 0.0], 0.8)));
        assert_eq!(gallery.dimension(), Some(3));
        assert!((gallery.average_quality() - 0.7).abs() < 1e-6);

        assert!(gallery.remove("a").is_some());
        assert!(gallery.remove("a").is_none());
        assert!(!gallery.contains("a"));
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_duplicate_names_allowed() {
        let mut gallery = Gallery::new();
        gallery.upsert(Identity::new("sam", enrollment(vec![1.0], 0.9)));
        gallery.upsert(Identity::new("sam", enrollment(vec![2.0], 0.9)));
        assert_eq!(gallery.len(), 2);
    }
}
