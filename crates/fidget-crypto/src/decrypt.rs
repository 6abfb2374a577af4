//! Entry decryption with two key-derivation strategies.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use aes::Aes256;
use fidget_core::{DecryptMethod, SessionRecord};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::symmetric::SymmetricKey;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Phrase used by firmware that predates configurable secret phrases.
pub const FALLBACK_PHRASE: &str = "biotech_shared_key_";

/// Hex characters holding the IV at the start of every encrypted entry.
pub const IV_HEX_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error("symmetric key not found")]
    MissingKey,

    #[error("encrypted data too short to contain an IV and ciphertext ({0} hex chars)")]
    TooShort(usize),

    #[error("invalid hex in encrypted data: {0}")]
    InvalidHex(String),

    #[error("bad padding or wrong key")]
    Padding,

    #[error("decrypted data is not valid UTF-8")]
    InvalidUtf8 { partial: String },

    #[error("decryption result is empty")]
    Empty,
}

/// How the cipher key is derived from the symmetric key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivation<'a> {
    /// `SHA-256(secret_phrase || key)`.
    Primary(&'a str),
    /// `SHA-256("biotech_shared_key_" || key)`.
    Fallback,
}

impl KeyDerivation<'_> {
    pub fn phrase(&self) -> &str {
        match self {
            Self::Primary(phrase) => phrase,
            Self::Fallback => FALLBACK_PHRASE,
        }
    }

    pub fn method(&self) -> DecryptMethod {
        match self {
            Self::Primary(_) => DecryptMethod::Standard,
            Self::Fallback => DecryptMethod::Simplified,
        }
    }

    pub fn derive(&self, key: &SymmetricKey) -> Zeroizing<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(self.phrase().as_bytes());
        hasher.update(key.as_bytes());
        Zeroizing::new(hasher.finalize().into())
    }

    /// Decrypts `iv || ciphertext` hex into non-empty UTF-8 text.
    pub fn decrypt_text(
        &self,
        encrypted_hex: &str,
        key: &SymmetricKey,
    ) -> Result<String, DecryptError> {
        let (iv, ciphertext) = split_iv(encrypted_hex)?;
        let cipher_key = self.derive(key);

        let plaintext = Aes256CbcDec::new_from_slices(cipher_key.as_slice(), &iv)
            .map_err(|_| DecryptError::Padding)?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| DecryptError::Padding)?;

        if plaintext.is_empty() {
            return Err(DecryptError::Empty);
        }
        match String::from_utf8(plaintext) {
            Ok(text) => Ok(text),
            Err(e) => Err(DecryptError::InvalidUtf8 {
                partial: String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }),
        }
    }
}

fn split_iv(encrypted_hex: &str) -> Result<(Vec<u8>, Vec<u8>), DecryptError> {
    if encrypted_hex.len() < IV_HEX_LEN {
        return Err(DecryptError::TooShort(encrypted_hex.len()));
    }
    if !encrypted_hex.is_ascii() {
        return Err(DecryptError::InvalidHex("non-ASCII input".into()));
    }
    let (iv_hex, ciphertext_hex) = encrypted_hex.split_at(IV_HEX_LEN);
    let iv = hex::decode(iv_hex).map_err(|e| DecryptError::InvalidHex(e.to_string()))?;
    let ciphertext =
        hex::decode(ciphertext_hex).map_err(|e| DecryptError::InvalidHex(e.to_string()))?;
    Ok((iv, ciphertext))
}

/// Both strategies failed for one entry.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Both decryption methods failed. Standard: {standard}, Simplified: {simplified}")]
pub struct DecryptionFailure {
    pub standard: DecryptError,
    pub simplified: DecryptError,
}

impl DecryptionFailure {
    /// Lossy text from the primary strategy when its cipher step succeeded
    /// but the plaintext was not UTF-8.
    pub fn partial(&self) -> Option<&str> {
        match &self.standard {
            DecryptError::InvalidUtf8 { partial } if !partial.is_empty() => Some(partial),
            _ => None,
        }
    }

    /// The record kept in the payload in place of the failed entry.
    pub fn into_record(self, original: Value) -> SessionRecord {
        if let Some(partial) = self.partial() {
            let mut record = SessionRecord::raw_text(partial, DecryptMethod::PartialFallback);
            record.error = Some(format!("{} | {}", self.standard, self.simplified));
            return record;
        }
        SessionRecord::failed(self.to_string(), Some(original))
    }
}

/// Decrypts one entry's `iv || ciphertext` hex, trying the primary strategy
/// first and the fallback second.
///
/// Plaintext that is not JSON is returned as `rawData` rather than failing.
pub fn decrypt_entry(
    encrypted_hex: &str,
    key: Option<&SymmetricKey>,
    secret_phrase: &str,
) -> Result<SessionRecord, DecryptionFailure> {
    debug!("decrypting entry of {} hex chars", encrypted_hex.len());

    let standard = match key {
        Some(key) => KeyDerivation::Primary(secret_phrase).decrypt_text(encrypted_hex, key),
        None => Err(DecryptError::MissingKey),
    };
    let standard = match standard {
        Ok(text) => return Ok(standard_record(text)),
        Err(e) => e,
    };
    warn!("standard decryption failed, trying simplified method: {}", standard);

    let simplified = match key {
        Some(key) => KeyDerivation::Fallback.decrypt_text(encrypted_hex, key),
        None => Err(DecryptError::MissingKey),
    };
    match simplified {
        Ok(text) => Ok(simplified_record(text)),
        Err(simplified) => {
            warn!("both decryption methods failed: {}", simplified);
            Err(DecryptionFailure {
                standard,
                simplified,
            })
        }
    }
}

fn standard_record(text: String) -> SessionRecord {
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => {
            let mut record = SessionRecord::from_value(value);
            record.decrypt_method.get_or_insert(DecryptMethod::Standard);
            record
        }
        Err(e) => {
            debug!("decrypted text is not JSON: {}", e);
            SessionRecord::raw_text(text, DecryptMethod::Standard)
        }
    }
}

fn simplified_record(text: String) -> SessionRecord {
    if !(text.starts_with('{') && text.contains('}')) {
        return SessionRecord::raw_text(text, DecryptMethod::Simplified);
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => {
            let mut record = SessionRecord::from_value(value);
            record.decrypt_method = Some(DecryptMethod::Simplified);
            record
        }
        Err(e) => {
            warn!("decryption produced text but not valid JSON: {}", e);
            let mut record = SessionRecord::raw_text(text, DecryptMethod::Simplified);
            record.partial_json = true;
            record
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    const IV: [u8; 16] = [7u8; 16];

    fn encrypt(plaintext: &[u8], derivation: KeyDerivation<'_>, key: &SymmetricKey) -> String {
        let cipher_key = derivation.derive(key);
        let ciphertext = Aes256CbcEnc::new_from_slices(cipher_key.as_slice(), &IV)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        format!("{}{}", hex::encode(IV), hex::encode(ciphertext))
    }

    #[test]
    fn derivations_differ() {
        let key = SymmetricKey::from_hex("00112233").unwrap();
        let primary = KeyDerivation::Primary("phrase").derive(&key);
        let fallback = KeyDerivation::Fallback.derive(&key);
        assert_ne!(*primary, *fallback);

        let mut expected = Sha256::new();
        expected.update(b"biotech_shared_key_");
        expected.update([0x00u8, 0x11, 0x22, 0x33]);
        let expected: [u8; 32] = expected.finalize().into();
        assert_eq!(*fallback, expected);
    }

    #[test]
    fn primary_json_entry() {
        let key = SymmetricKey::generate();
        let hex = encrypt(br#"{"id":1,"avg":72}"#, KeyDerivation::Primary("s3cret"), &key);
        let record = decrypt_entry(&hex, Some(&key), "s3cret").unwrap();
        assert_eq!(record.id, Some(1));
        assert_eq!(record.decrypt_method, Some(DecryptMethod::Standard));
    }

    #[test]
    fn fallback_malformed_json_is_partial() {
        let key = SymmetricKey::generate();
        let hex = encrypt(b"{\"id\": 1,}", KeyDerivation::Fallback, &key);
        let record = decrypt_entry(&hex, Some(&key), "s3cret").unwrap();
        assert_eq!(record.raw_data.as_deref(), Some("{\"id\": 1,}"));
        assert_eq!(record.decrypt_method, Some(DecryptMethod::Simplified));
        assert!(record.partial_json);
    }

    #[test]
    fn garbage_fails_both() {
        let key = SymmetricKey::generate();
        let failure = decrypt_entry(&"ab".repeat(40), Some(&key), "s3cret").unwrap_err();
        assert_eq!(failure.standard, DecryptError::Padding);
        assert_eq!(failure.simplified, DecryptError::Padding);
        assert!(failure.to_string().starts_with("Both decryption methods failed. Standard:"));
    }

    #[test]
    fn short_or_non_hex_input() {
        let key = SymmetricKey::generate();
        let failure = decrypt_entry("abcd", Some(&key), "p").unwrap_err();
        assert_eq!(failure.standard, DecryptError::TooShort(4));

        let failure = decrypt_entry(&"g".repeat(64), Some(&key), "p").unwrap_err();
        assert!(matches!(failure.standard, DecryptError::InvalidHex(_)));
    }

    #[test]
    fn missing_key_fails_both() {
        let failure = decrypt_entry(&"00".repeat(32), None, "p").unwrap_err();
        assert_eq!(failure.standard, DecryptError::MissingKey);
        assert_eq!(failure.simplified, DecryptError::MissingKey);
        let record = failure.into_record(serde_json::json!({"encrypted": true}));
        assert!(record.error.unwrap().contains("symmetric key not found"));
        assert_eq!(record.original_data, Some(serde_json::json!({"encrypted": true})));
    }

    #[test]
    fn partial_plaintext_is_surfaced() {
        let key = SymmetricKey::from_hex(&"5a".repeat(64)).unwrap();
        let hex = encrypt(&[b'o', b'k', 0xff, 0xfe], KeyDerivation::Primary("p"), &key);
        let failure = decrypt_entry(&hex, Some(&key), "p").unwrap_err();
        assert!(failure.partial().is_some());

        let record = failure.into_record(Value::Null);
        assert_eq!(record.decrypt_method, Some(DecryptMethod::PartialFallback));
        assert!(record.raw_data.unwrap().starts_with("ok"));
        assert!(record.error.unwrap().contains(" | "));
        assert!(record.original_data.is_none());
    }
}
