//! Gallery document: the JSON structure sealed inside the envelope, and
//! the plaintext export format used for fixtures.
//!
//! ```json
//! { "version": 1,
//!   "identities": [ { "id": "...", "displayName": "...", "encoding": [0.1, ...],
//!                     "qualityScore": 0.93, "integrityHash": "...",
//!                     "createdAt": "2026-01-01T00:00:00Z" } ] }
//! ```

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use faceid_core::{Embedding, Identity, IntegrityViolation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub id: String,
    pub display_name: String,
    pub encoding: Vec<f32>,
    pub quality_score: f32,
    pub integrity_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl From<&Identity> for IdentityRecord {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            encoding: identity.canonical_encoding.values.clone(),
            quality_score: identity.quality_score,
            integrity_hash: identity.integrity_hash.clone(),
            created_at: identity.created_at,
            model_version: identity.canonical_encoding.model_version.clone(),
        }
    }
}

impl From<IdentityRecord> for Identity {
    /// Carries the stored hash over untouched; verification is the loader's job.
    fn from(record: IdentityRecord) -> Self {
        Identity {
            id: record.id,
            display_name: record.display_name,
            canonical_encoding: Embedding {
                values: record.encoding,
                model_version: record.model_version,
            },
            quality_score: record.quality_score,
            integrity_hash: record.integrity_hash,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryDocument {
    pub version: u32,
    pub identities: Vec<IdentityRecord>,
}

impl GalleryDocument {
    pub fn from_identities<'a>(identities: impl IntoIterator<Item = &'a Identity>) -> Self {
        Self {
            version: FORMAT_VERSION,
            identities: identities.into_iter().map(IdentityRecord::from).collect(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, StoreError> {
        let doc: Self = serde_json::from_slice(bytes)?;
        if doc.version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(doc.version));
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn into_identities(self) -> Vec<Identity> {
        self.identities.into_iter().map(Identity::from).collect()
    }
}

/// Version-checked document whose records are still undecoded JSON.
///
/// This is the form sealed inside the envelope. Records are decoded one by
/// one, so a single unreadable record cannot hide the rest of the gallery,
/// and unreadable records can be written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawGalleryDocument {
    pub version: u32,
    pub identities: Vec<Value>,
}

/// One stored record after decoding.
#[derive(Debug, Clone)]
pub enum DecodedRecord {
    Identity(Identity),
    Unreadable {
        raw: Value,
        violation: IntegrityViolation,
    },
}

impl RawGalleryDocument {
    /// Decoded identities first, then unreadable records verbatim.
    pub fn from_parts<'a>(
        identities: impl IntoIterator<Item = &'a Identity>,
        unreadable: &[Value],
    ) -> Result<Self, StoreError> {
        let mut records = identities
            .into_iter()
            .map(|identity| serde_json::to_value(IdentityRecord::from(identity)))
            .collect::<Result<Vec<_>, _>>()?;
        records.extend(unreadable.iter().cloned());
        Ok(Self {
            version: FORMAT_VERSION,
            identities: records,
        })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, StoreError> {
        let doc: Self = serde_json::from_slice(bytes)?;
        if doc.version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(doc.version));
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(self) -> Vec<DecodedRecord> {
        self.identities.into_iter().map(decode_record).collect()
    }
}

/// Id of a raw record, when it has a string `id` field.
pub fn raw_record_id(raw: &Value) -> Option<&str> {
    raw.get("id").and_then(Value::as_str)
}

fn decode_record(raw: Value) -> DecodedRecord {
    match serde_json::from_value::<IdentityRecord>(raw.clone()) {
        Ok(record) => DecodedRecord::Identity(record.into()),
        Err(e) => {
            let field = |name: &str| raw.get(name).and_then(Value::as_str).unwrap_or("").to_string();
            let violation = IntegrityViolation::unreadable(
                field("id"),
                field("displayName"),
                field("integrityHash"),
                e.to_string(),
            );
            DecodedRecord::Unreadable { raw, violation }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::Enrollment;

    fn sample_identity(name: &str, values: Vec<f32>) -> Identity {
        Identity::new(
            name,
            Enrollment {
                encoding: Embedding::new(values),
                quality_score: 0.87,
                samples_used: 12,
            },
        )
    }

    #[test]
    fn test_field_names() {
        let identity = sample_identity("Ada", vec![0.25, -0.5]);
        let doc = GalleryDocument::from_identities([&identity]);
        let json: serde_json::Value = serde_json::from_slice(&doc.to_json().unwrap()).unwrap();

        assert_eq!(json["version"], 1);
        let rec = &json["identities"][0];
        assert_eq!(rec["id"], identity.id.as_str());
        assert_eq!(rec["displayName"], "Ada");
        assert_eq!(rec["encoding"], serde_json::json!([0.25, -0.5]));
        assert!(rec["qualityScore"].is_number());
        assert_eq!(rec["integrityHash"], identity.integrity_hash.as_str());
        assert!(rec["createdAt"].is_string());
        assert!(rec.get("modelVersion").is_none());
    }

    #[test]
    fn test_identity_survives_json() {
        let identity = sample_identity("Grace", vec![0.1, 0.2, 0.3, 1.0e-7, -3.4e10]);
        let doc = GalleryDocument::from_identities([&identity]);
        let back = GalleryDocument::from_json(&doc.to_json().unwrap())
            .unwrap()
            .into_identities();
        assert_eq!(back, vec![identity.clone()]);
        assert!(back[0].verify_integrity());
    }

    #[test]
    fn test_unsupported_version() {
        let json = br#"{"version": 2, "identities": []}"#;
        assert!(matches!(
            GalleryDocument::from_json(json),
            Err(StoreError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_raw_document_decodes_per_record() {
        let good = sample_identity("Ada", vec![0.5, 0.5]);
        let doc = RawGalleryDocument::from_parts([&good], &[]).unwrap();
        let mut json: Value = serde_json::from_slice(&doc.to_json().unwrap()).unwrap();
        let mut broken = json["identities"][0].clone();
        broken["id"] = Value::from("broken-1");
        broken["qualityScore"] = Value::Null;
        json["identities"].as_array_mut().unwrap().push(broken.clone());

        let raw = RawGalleryDocument::from_json(&serde_json::to_vec(&json).unwrap()).unwrap();
        let decoded = raw.decode();
        assert_eq!(decoded.len(), 2);
        assert!(matches!(&decoded[0], DecodedRecord::Identity(i) if *i == good));
        match &decoded[1] {
            DecodedRecord::Unreadable { raw, violation } => {
                assert_eq!(*raw, broken);
                assert_eq!(raw_record_id(raw), Some("broken-1"));
                assert_eq!(violation.identity_id, "broken-1");
                assert_eq!(violation.display_name, "Ada");
                assert!(matches!(
                    violation.reason,
                    faceid_core::ViolationReason::Unreadable(_)
                ));
            }
            other => panic!("expected unreadable record, got {other:?}"),
        }

        // Unreadable records are written back verbatim.
        let rewritten = RawGalleryDocument::from_parts([&good], &[broken.clone()]).unwrap();
        assert_eq!(rewritten.identities[1], broken);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            GalleryDocument::from_json(b"not json"),
            Err(StoreError::Serialization(_))
        ));
    }
}
