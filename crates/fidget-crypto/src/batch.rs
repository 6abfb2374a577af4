//! Batch decryption of a device payload's `data` array.

use fidget_core::payload::entry_ciphertext;
use fidget_core::SessionRecord;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::decrypt::decrypt_entry;
use crate::symmetric::SymmetricKey;

/// Reported when no entry of a payload could be decrypted.
pub const INCOMPATIBLE_PAYLOAD: &str =
    "Failed to decrypt any sessions. The data format may be incompatible.";

/// Decrypts payload entries with one symmetric key and secret phrase.
#[derive(Debug)]
pub struct PayloadDecryptor {
    key: Option<SymmetricKey>,
    secret_phrase: String,
}

impl PayloadDecryptor {
    /// A missing key fails every encrypted entry; plain entries still pass.
    pub fn new(key: Option<SymmetricKey>, secret_phrase: impl Into<String>) -> Self {
        Self {
            key,
            secret_phrase: secret_phrase.into(),
        }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Decrypts one entry, or passes it through when it is not encrypted.
    pub fn decrypt(&self, entry: &Value) -> SessionRecord {
        let Some(ciphertext) = entry_ciphertext(entry) else {
            return SessionRecord::from_value(entry.clone());
        };

        match decrypt_entry(ciphertext, self.key.as_ref(), &self.secret_phrase) {
            Ok(record) => record,
            Err(failure) => failure.into_record(entry.clone()),
        }
    }

    /// Decrypts each entry independently. Failed entries stay in place as
    /// error records.
    pub fn decrypt_entries(&self, entries: &[Value]) -> DecryptedBatch {
        debug!("decrypting {} payload entries", entries.len());
        let records: Vec<SessionRecord> = entries.iter().map(|e| self.decrypt(e)).collect();
        let any_success = records.iter().any(|r| !r.is_error());

        let failed = records.iter().filter(|r| r.is_error()).count();
        if any_success {
            info!("decrypted payload: {} entries, {} failed", records.len(), failed);
        } else {
            warn!("{}", INCOMPATIBLE_PAYLOAD);
        }

        DecryptedBatch {
            records,
            any_success,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedBatch {
    pub records: Vec<SessionRecord>,
    pub any_success: bool,
}

impl DecryptedBatch {
    pub fn likely_incompatible(&self) -> bool {
        !self.any_success
    }

    /// User-facing message when nothing decrypted.
    pub fn diagnostic(&self) -> Option<&'static str> {
        self.likely_incompatible().then_some(INCOMPATIBLE_PAYLOAD)
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.records.iter().map(SessionRecord::to_value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_entries_pass_through() {
        let decryptor = PayloadDecryptor::new(None, "phrase");
        let batch = decryptor.decrypt_entries(&[json!({"id": 3, "avg": 70})]);
        assert!(batch.any_success);
        assert_eq!(batch.records[0].id, Some(3));
        assert!(batch.diagnostic().is_none());
    }

    #[test]
    fn missing_key_fails_encrypted_entries_only() {
        let decryptor = PayloadDecryptor::new(None, "phrase");
        let encrypted = json!({"encrypted": true, "data": "00".repeat(32)});
        let batch = decryptor.decrypt_entries(&[encrypted.clone(), json!({"id": 1})]);
        assert!(batch.records[0].is_error());
        assert_eq!(batch.records[0].original_data, Some(encrypted.clone()));
        assert!(!batch.records[1].is_error());
        assert!(batch.any_success);

        let batch = decryptor.decrypt_entries(&[encrypted]);
        assert!(batch.likely_incompatible());
        assert_eq!(batch.diagnostic(), Some(INCOMPATIBLE_PAYLOAD));
    }

    #[test]
    fn string_encrypted_flag_is_not_encrypted() {
        let decryptor = PayloadDecryptor::new(Some(SymmetricKey::generate()), "phrase");
        let entry = json!({"encrypted": "true", "data": "zz"});
        let record = decryptor.decrypt(&entry);
        assert!(!record.is_error());
        assert_eq!(record.to_value(), entry);
    }
}
