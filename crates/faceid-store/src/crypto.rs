//! Authenticated encryption of the serialized gallery.
//!
//! - **Algorithm**: AES-256-GCM
//! - **Key**: 32 bytes, supplied by the caller and never written into the
//!   sealed artifact
//! - **Nonce**: 12 random bytes per seal
//! - **Format**: `FACEID_GALLERY_V1\0` magic + nonce + ciphertext + tag; the
//!   magic is also bound as associated data
//!
//! Any change to the sealed bytes, or the wrong key, fails at [`open`].

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::path::Path;
use thiserror::Error;

/// Magic bytes identifying a sealed gallery.
pub const MAGIC_HEADER: &[u8] = b"FACEID_GALLERY_V1\0";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("authentication failed: wrong key or corrupted ciphertext")]
    Authentication,
    #[error("malformed sealed data: {0}")]
    Malformed(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("key file: {0}")]
    Io(#[from] std::io::Error),
}

/// 256-bit gallery key.
#[derive(Clone, PartialEq, Eq)]
pub struct GalleryKey([u8; KEY_SIZE]);

impl GalleryKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("bad hex: {e}")))?;
        let bytes: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {} hex characters, got {}",
                KEY_SIZE * 2,
                encoded.trim().len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Read a raw 32-byte key file.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let bytes = std::fs::read(path)?;
        let bytes: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "{} holds {} bytes, expected {KEY_SIZE}",
                path.display(),
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Write the key as raw bytes, owner-readable only on Unix.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.0)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for GalleryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GalleryKey(..)")
    }
}

/// Encrypt `plaintext` under `key`.
pub fn seal(plaintext: &[u8], key: &GalleryKey) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: MAGIC_HEADER,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut output = Vec::with_capacity(MAGIC_HEADER.len() + NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(MAGIC_HEADER);
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);

    tracing::debug!(
        plaintext_len = plaintext.len(),
        sealed_len = output.len(),
        "sealed gallery"
    );
    Ok(output)
}

/// Decrypt and authenticate data produced by [`seal`].
pub fn open(sealed: &[u8], key: &GalleryKey) -> Result<Vec<u8>, CryptoError> {
    let min_size = MAGIC_HEADER.len() + NONCE_SIZE + TAG_SIZE;
    if sealed.len() < min_size {
        return Err(CryptoError::Malformed(format!(
            "{} bytes, minimum {min_size}",
            sealed.len()
        )));
    }
    if !is_sealed(sealed) {
        return Err(CryptoError::Malformed("missing magic header".into()));
    }

    let nonce_start = MAGIC_HEADER.len();
    let nonce_end = nonce_start + NONCE_SIZE;
    let nonce = Nonce::from_slice(&sealed[nonce_start..nonce_end]);

    key.cipher()
        .decrypt(
            nonce,
            Payload {
                msg: &sealed[nonce_end..],
                aad: MAGIC_HEADER,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}

/// Whether `data` starts with the sealed-gallery magic.
pub fn is_sealed(data: &[u8]) -> bool {
    data.starts_with(MAGIC_HEADER)
}
