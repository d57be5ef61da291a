//! faceid-store: Encrypted gallery persistence.
//!
//! The gallery is serialized to a versioned JSON document, sealed with
//! AES-256-GCM, and handed to a [`Persistence`] backend as one opaque blob.
//! [`GalleryStore`] owns the published snapshot that matchers read from.

pub mod backend;
pub mod crypto;
pub mod document;
pub mod error;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, Persistence, PersistenceError, SqliteBackend};
pub use crypto::{CryptoError, GalleryKey};
pub use document::{
    raw_record_id, DecodedRecord, GalleryDocument, IdentityRecord, RawGalleryDocument, FORMAT_VERSION,
};
pub use error::StoreError;
pub use store::{GalleryStats, GalleryStore, ImportReport, LoadReport};
