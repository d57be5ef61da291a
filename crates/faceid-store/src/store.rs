//! Encrypted, snapshot-published identity gallery.
//!
//! Readers take an `Arc<Gallery>` snapshot and match against it without
//! holding any lock. Writers serialize on one mutex, build a new gallery
//! value, persist it (seal + atomic replace), and only then publish it.
//! In-flight readers finish against the snapshot they already hold.
//!
//! Records that fail verification on load are quarantined: they are kept
//! out of the matchable snapshot, reported, re-persisted unchanged on later
//! writes, and can be replaced or removed by id. Mutations are refused until
//! the persisted gallery has been loaded, so a write can never clobber
//! identities the store has not seen.

use crate::backend::Persistence;
use crate::crypto::{self, GalleryKey};
use crate::document::{raw_record_id, DecodedRecord, GalleryDocument, RawGalleryDocument};
use crate::error::StoreError;
use faceid_core::{
    Enrollment, Event, Gallery, Identity, IntegrityViolation, Notifier, NullNotifier,
    ViolationReason,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Outcome of [`GalleryStore::load`].
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub gallery: Arc<Gallery>,
    pub violations: Vec<IntegrityViolation>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Outcome of [`GalleryStore::import`].
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub rejected: Vec<IntegrityViolation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GalleryStats {
    pub total_identities: usize,
    pub average_quality: f32,
    pub dimension: Option<usize>,
    pub quarantined: usize,
    pub integrity_ok: bool,
}

/// Writer-side state, guarded by the commit mutex.
#[derive(Default)]
struct WriterState {
    loaded: bool,
    /// Decodable records that failed verification.
    quarantine: Vec<Identity>,
    /// Records that could not be decoded, kept verbatim.
    unreadable: Vec<Value>,
}

impl WriterState {
    fn holds(&self, id: &str) -> bool {
        self.quarantine.iter().any(|q| q.id == id)
            || self.unreadable.iter().any(|r| raw_record_id(r) == Some(id))
    }

    fn quarantined_len(&self) -> usize {
        self.quarantine.len() + self.unreadable.len()
    }
}

pub struct GalleryStore {
    backend: Box<dyn Persistence>,
    key: GalleryKey,
    snapshot: RwLock<Arc<Gallery>>,
    writer: Mutex<WriterState>,
    notifier: Arc<dyn Notifier>,
}

impl GalleryStore {
    /// Unloaded store; call [`GalleryStore::load`] before mutating it.
    pub fn new(backend: impl Persistence + 'static, key: GalleryKey) -> Self {
        Self {
            backend: Box::new(backend),
            key,
            snapshot: RwLock::new(Arc::new(Gallery::new())),
            writer: Mutex::new(WriterState::default()),
            notifier: Arc::new(NullNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Construct and load in one step.
    pub fn open(
        backend: impl Persistence + 'static,
        key: GalleryKey,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(Self, LoadReport), StoreError> {
        let store = Self::new(backend, key).with_notifier(notifier);
        let report = store.load()?;
        Ok((store, report))
    }

    /// Decrypt, parse and verify the persisted gallery, then publish it.
    ///
    /// A missing blob is an empty gallery. Authentication failures and an
    /// unsupported document version are fatal; everything else is reported
    /// per record.
    pub fn load(&self) -> Result<LoadReport, StoreError> {
        let mut writer = self.lock_writer();

        let Some(sealed) = self.backend.read()? else {
            tracing::info!(backend = %self.backend.describe(), "no gallery stored yet");
            *writer = WriterState {
                loaded: true,
                ..WriterState::default()
            };
            let gallery = Arc::new(Gallery::new());
            self.publish(gallery.clone());
            return Ok(LoadReport {
                gallery,
                violations: Vec::new(),
            });
        };

        let plaintext = crypto::open(&sealed, &self.key).map_err(|e| {
            tracing::error!(backend = %self.backend.describe(), error = %e, "gallery authentication failed");
            StoreError::from(e)
        })?;
        let doc = RawGalleryDocument::from_json(&plaintext)?;

        let mut gallery = Gallery::new();
        let mut state = WriterState {
            loaded: true,
            ..WriterState::default()
        };
        let mut violations = Vec::new();
        let mut seen = HashSet::new();

        for record in doc.decode() {
            let identity = match record {
                DecodedRecord::Identity(identity) => identity,
                DecodedRecord::Unreadable { raw, violation } => {
                    self.report(&violation);
                    violations.push(violation);
                    state.unreadable.push(raw);
                    continue;
                }
            };

            let violation = if !seen.insert(identity.id.clone()) {
                Some(IntegrityViolation::duplicate(&identity))
            } else {
                IntegrityViolation::inspect(&identity)
                    .or_else(|| dimension_violation(&gallery, &identity))
            };

            match violation {
                None => {
                    gallery.upsert(identity);
                }
                Some(violation) => {
                    self.report(&violation);
                    violations.push(violation);
                    state.quarantine.push(identity);
                }
            }
        }

        tracing::info!(
            backend = %self.backend.describe(),
            identities = gallery.len(),
            quarantined = state.quarantined_len(),
            "gallery loaded"
        );

        *writer = state;
        let gallery = Arc::new(gallery);
        self.publish(gallery.clone());
        Ok(LoadReport {
            gallery,
            violations,
        })
    }

    /// Current gallery snapshot. Cheap; never blocks on writers for longer
    /// than the pointer swap.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.snapshot
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Insert or replace an identity (by id) and persist the whole gallery.
    ///
    /// The integrity hash is recomputed. Returns `true` when an existing
    /// identity was replaced.
    pub fn commit(&self, identity: Identity) -> Result<bool, StoreError> {
        let mut writer = self.loaded_writer()?;
        self.commit_locked(&mut writer, identity)
    }

    /// Create and commit a new identity from an enrollment.
    pub fn enroll(
        &self,
        display_name: impl Into<String>,
        enrollment: Enrollment,
    ) -> Result<Identity, StoreError> {
        let mut writer = self.loaded_writer()?;
        let identity = Identity::new(display_name, enrollment);
        self.commit_locked(&mut writer, identity.clone())?;
        Ok(identity)
    }

    /// Commit under a caller-chosen id; an id already stored (active or
    /// quarantined) is an error.
    pub fn enroll_with_id(
        &self,
        id: impl Into<String>,
        display_name: impl Into<String>,
        enrollment: Enrollment,
    ) -> Result<Identity, StoreError> {
        let id = id.into();
        let mut writer = self.loaded_writer()?;
        if self.snapshot().contains(&id) || writer.holds(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        let identity = Identity::with_id(id, display_name, enrollment);
        self.commit_locked(&mut writer, identity.clone())?;
        Ok(identity)
    }

    /// Replace an existing identity's encoding and quality; id and name stay.
    pub fn reenroll(&self, id: &str, enrollment: Enrollment) -> Result<Identity, StoreError> {
        let mut writer = self.loaded_writer()?;
        let mut identity = self
            .snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        identity.reenroll(enrollment);
        self.commit_locked(&mut writer, identity.clone())?;
        Ok(identity)
    }

    /// Delete by id, from the active gallery or the quarantine.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut writer = self.loaded_writer()?;
        let current = self.snapshot();

        let mut next = (*current).clone();
        let removed_active = next.remove(id).is_some();

        let removed_quarantined = writer.holds(id);
        if !removed_active && !removed_quarantined {
            return Ok(false);
        }

        let mut quarantine = writer.quarantine.clone();
        quarantine.retain(|q| q.id != id);
        let mut unreadable = writer.unreadable.clone();
        unreadable.retain(|r| raw_record_id(r) != Some(id));

        self.persist(&next, &quarantine, &unreadable)?;
        writer.quarantine = quarantine;
        writer.unreadable = unreadable;
        self.publish(Arc::new(next));

        tracing::info!(identity = %id, quarantined = removed_quarantined, "identity removed");
        Ok(true)
    }

    /// Decodable quarantined identities. Undecodable records are only
    /// counted in [`GalleryStats::quarantined`].
    pub fn quarantined(&self) -> Vec<Identity> {
        self.lock_writer().quarantine.clone()
    }

    pub fn stats(&self) -> GalleryStats {
        let quarantined = self.lock_writer().quarantined_len();
        let gallery = self.snapshot();
        GalleryStats {
            total_identities: gallery.len(),
            average_quality: gallery.average_quality(),
            dimension: gallery.dimension(),
            quarantined,
            integrity_ok: quarantined == 0 && gallery.iter().all(Identity::verify_integrity),
        }
    }

    /// Plaintext document of every decodable identity (active, then
    /// quarantined). For fixtures and migration only.
    pub fn export(&self) -> Result<GalleryDocument, StoreError> {
        let writer = self.loaded_writer()?;
        if !writer.unreadable.is_empty() {
            tracing::warn!(
                records = writer.unreadable.len(),
                "export: undecodable records left out"
            );
        }
        let gallery = self.snapshot();
        Ok(GalleryDocument::from_identities(
            gallery.iter().chain(writer.quarantine.iter()),
        ))
    }

    /// Commit every identity in `doc` that verifies, in a single write.
    ///
    /// Records with a bad hash, invalid values, a foreign dimension, or an
    /// id repeated within `doc` are reported and skipped. Ids already in the
    /// gallery are replaced.
    pub fn import(&self, doc: GalleryDocument) -> Result<ImportReport, StoreError> {
        let mut writer = self.loaded_writer()?;
        let current = self.snapshot();
        let mut next = (*current).clone();
        let mut report = ImportReport::default();
        let mut seen = HashSet::new();

        for identity in doc.into_identities() {
            let violation = if !seen.insert(identity.id.clone()) {
                Some(IntegrityViolation::duplicate(&identity))
            } else {
                IntegrityViolation::inspect(&identity)
                    .or_else(|| dimension_violation(&next, &identity))
            };
            if let Some(violation) = violation {
                tracing::warn!(
                    identity = %violation.identity_id,
                    reason = ?violation.reason,
                    "import: record skipped"
                );
                report.rejected.push(violation);
                continue;
            }
            next.upsert(identity);
            report.imported += 1;
        }

        if report.imported == 0 {
            return Ok(report);
        }

        let mut quarantine = writer.quarantine.clone();
        quarantine.retain(|q| !next.contains(&q.id));
        let mut unreadable = writer.unreadable.clone();
        unreadable.retain(|r| !raw_record_id(r).is_some_and(|id| next.contains(id)));

        self.persist(&next, &quarantine, &unreadable)?;
        writer.quarantine = quarantine;
        writer.unreadable = unreadable;
        self.publish(Arc::new(next));
        tracing::info!(
            imported = report.imported,
            rejected = report.rejected.len(),
            "gallery imported"
        );
        Ok(report)
    }

    /// Write the sealed current gallery to
    /// `<dir>/gallery_backup_<YYYYmmdd_HHMMSS>.enc`.
    pub fn backup(&self, dir: &Path) -> Result<PathBuf, StoreError> {
        let sealed = {
            let writer = self.loaded_writer()?;
            let gallery = self.snapshot();
            self.seal(&gallery, &writer.quarantine, &writer.unreadable)?
        };

        std::fs::create_dir_all(dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let mut path = dir.join(format!("gallery_backup_{stamp}.enc"));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("gallery_backup_{stamp}_{n}.enc"));
            n += 1;
        }
        crate::backend::FileBackend::new(&path).replace(&sealed)?;

        tracing::info!(path = %path.display(), "gallery backup written");
        Ok(path)
    }

    fn commit_locked(
        &self,
        writer: &mut WriterState,
        mut identity: Identity,
    ) -> Result<bool, StoreError> {
        identity
            .validate()
            .map_err(|source| StoreError::InvalidIdentity {
                id: identity.id.clone(),
                source,
            })?;

        let current = self.snapshot();
        if let Some(expected) = current
            .iter()
            .find(|i| i.id != identity.id)
            .map(Identity::dimension)
        {
            if identity.dimension() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: identity.dimension(),
                });
            }
        }

        identity.rehash();
        let id = identity.id.clone();

        let mut next = (*current).clone();
        let replaced = next.upsert(identity).is_some();

        let healed = writer.holds(&id);
        let mut quarantine = writer.quarantine.clone();
        quarantine.retain(|q| q.id != id);
        let mut unreadable = writer.unreadable.clone();
        unreadable.retain(|r| raw_record_id(r) != Some(id.as_str()));

        self.persist(&next, &quarantine, &unreadable)?;
        writer.quarantine = quarantine;
        writer.unreadable = unreadable;
        self.publish(Arc::new(next));

        tracing::info!(identity = %id, replaced, healed, "identity committed");
        self.notifier.notify(&Event::enrolled(id));
        Ok(replaced)
    }

    fn seal(
        &self,
        gallery: &Gallery,
        quarantine: &[Identity],
        unreadable: &[Value],
    ) -> Result<Vec<u8>, StoreError> {
        let doc = RawGalleryDocument::from_parts(gallery.iter().chain(quarantine.iter()), unreadable)?;
        Ok(crypto::seal(&doc.to_json()?, &self.key)?)
    }

    fn persist(
        &self,
        gallery: &Gallery,
        quarantine: &[Identity],
        unreadable: &[Value],
    ) -> Result<(), StoreError> {
        let sealed = self.seal(gallery, quarantine, unreadable)?;
        self.backend.replace(&sealed)?;
        Ok(())
    }

    fn report(&self, violation: &IntegrityViolation) {
        tracing::warn!(
            identity = %violation.identity_id,
            name = %violation.display_name,
            reason = ?violation.reason,
            "gallery record failed verification; quarantined"
        );
        self.notifier
            .notify(&Event::integrity_violation(violation.identity_id.clone()));
    }

    fn publish(&self, gallery: Arc<Gallery>) {
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = gallery;
    }

    fn lock_writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn loaded_writer(&self) -> Result<MutexGuard<'_, WriterState>, StoreError> {
        let writer = self.lock_writer();
        if !writer.loaded {
            return Err(StoreError::NotLoaded);
        }
        Ok(writer)
    }
}

/// An identity whose dimension differs from the rest of `gallery`.
fn dimension_violation(gallery: &Gallery, identity: &Identity) -> Option<IntegrityViolation> {
    let expected = gallery
        .iter()
        .find(|i| i.id != identity.id)
        .map(Identity::dimension)?;
    if identity.dimension() == expected {
        return None;
    }
    Some(IntegrityViolation {
        identity_id: identity.id.clone(),
        display_name: identity.display_name.clone(),
        stored_hash: identity.integrity_hash.clone(),
        computed_hash: identity.integrity_hash.clone(),
        reason: ViolationReason::InvalidValues(format!(
            "dimension {}, gallery uses {expected}",
            identity.dimension()
        )),
    })
}
