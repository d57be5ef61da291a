use crate::backend::PersistenceError;
use crate::crypto::CryptoError;
use faceid_core::InvalidIdentity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Wrong key, tampered or truncated envelope. The gallery stays
    /// unavailable until this is resolved.
    #[error("gallery unavailable: {0}")]
    Authentication(#[source] CryptoError),
    #[error("crypto: {0}")]
    Crypto(#[source] CryptoError),
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("gallery document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported gallery format version {0}")]
    UnsupportedVersion(u32),
    #[error("embedding dimension mismatch: gallery uses {expected}, identity has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("identity {0} already exists")]
    DuplicateId(String),
    #[error("identity {0} not found")]
    NotFound(String),
    #[error("identity {id} rejected: {source}")]
    InvalidIdentity {
        id: String,
        #[source]
        source: InvalidIdentity,
    },
    #[error("gallery not loaded; load it before making changes")]
    NotLoaded,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for StoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication | CryptoError::Malformed(_) => Self::Authentication(err),
            other => Self::Crypto(other),
        }
    }
}

impl StoreError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}
