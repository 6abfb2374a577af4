//! Symmetric device key.
//!
//! The key is 64 random bytes generated on the host, sent to the device as
//! 128 lowercase hex characters with the `P:` command, and persisted so later
//! payloads can be decrypted.
//!
//! # Example
//!
//! ```
//! use fidget_crypto::SymmetricKey;
//!
//! let key = SymmetricKey::generate();
//! let hex = key.to_hex();
//! assert_eq!(hex.len(), 128);
//!
//! let restored = SymmetricKey::from_hex(&hex).unwrap();
//! assert_eq!(restored.as_bytes(), key.as_bytes());
//! ```

use fidget_core::command::redact;
use fidget_core::SYMMETRIC_KEY_BYTES;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("symmetric key is empty")]
    Empty,

    #[error("symmetric key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Shared secret between host and device. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    bytes: Vec<u8>,
}

impl SymmetricKey {
    /// Generate a new random key using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SYMMETRIC_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Parse a stored key. Surrounding whitespace and letter case are ignored.
    pub fn from_hex(hex_key: &str) -> Result<Self, KeyError> {
        let normalized = hex_key.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(KeyError::Empty);
        }
        let bytes = hex::decode(&normalized)?;
        Ok(Self { bytes })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The first characters of the hex form, safe to log.
    pub fn fingerprint(&self) -> String {
        redact(&self.to_hex())
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({})", self.fingerprint())
    }
}
