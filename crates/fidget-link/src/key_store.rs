//! Persisted device key material.
//!
//! Two fields survive process restarts: `deviceWallet`, the wallet the
//! device was last bound to, and `deviceEncryptionKey`, the hex symmetric
//! key shared with it.

use fidget_core::{DeviceIdentity, DEVICE_KEY_FIELD, DEVICE_WALLET_FIELD};
use fidget_crypto::SymmetricKey;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::KeyStoreError;

pub const STORE_FILE_NAME: &str = "device-link.json";

/// String key-value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), KeyStoreError>;
    fn remove(&self, key: &str) -> Result<(), KeyStoreError>;
}

/// A JSON object in one file, rewritten on every change.
///
/// The file is created with owner-only permissions on Unix.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>, KeyStoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&text).map_err(|e| KeyStoreError::Format(e.to_string()))
    }

    fn save(&self, values: &Map<String, Value>) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(values)
            .map_err(|e| KeyStoreError::Format(e.to_string()))?;
        fs::write(&self.path, text)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut Map<String, Value>)) -> Result<(), KeyStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.load()?;
        apply(&mut values);
        self.save(&values)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .load()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KeyStoreError> {
        self.update(|values| {
            values.insert(key.to_string(), Value::String(value.to_string()));
        })
    }

    fn remove(&self, key: &str) -> Result<(), KeyStoreError> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KeyStoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KeyStoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// Typed access to the persisted symmetric key and device identity.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn KeyValueStore>,
}

impl KeyStore {
    pub fn new(backend: impl KeyValueStore + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::default())
    }

    /// A file-backed store at `<dir>/device-link.json`.
    pub fn open(dir: &Path) -> Self {
        Self::new(FileStore::new(dir.join(STORE_FILE_NAME)))
    }

    /// Returns the persisted key, generating and persisting a new one when
    /// none exists.
    pub fn get_or_create_symmetric_key(&self) -> Result<SymmetricKey, KeyStoreError> {
        if let Some(key) = self.symmetric_key()? {
            return Ok(key);
        }
        let key = SymmetricKey::generate();
        self.backend.set(DEVICE_KEY_FIELD, &key.to_hex())?;
        info!("generated new symmetric key {}", key.fingerprint());
        Ok(key)
    }

    pub fn symmetric_key(&self) -> Result<Option<SymmetricKey>, KeyStoreError> {
        match self.backend.get(DEVICE_KEY_FIELD)? {
            Some(stored) if !stored.trim().is_empty() => {
                Ok(Some(SymmetricKey::from_hex(&stored)?))
            }
            _ => Ok(None),
        }
    }

    pub fn remember_device_identity(&self, wallet_address: &str) -> Result<(), KeyStoreError> {
        debug!("remembering device wallet {}", wallet_address);
        self.backend.set(DEVICE_WALLET_FIELD, wallet_address)
    }

    pub fn forget_device_identity(&self) -> Result<(), KeyStoreError> {
        self.backend.remove(DEVICE_WALLET_FIELD)
    }

    pub fn device_identity(&self) -> Result<Option<DeviceIdentity>, KeyStoreError> {
        Ok(self.backend.get(DEVICE_WALLET_FIELD)?.map(DeviceIdentity::new))
    }

    /// Removes both the identity and the symmetric key.
    pub fn reset(&self) -> Result<(), KeyStoreError> {
        self.backend.remove(DEVICE_WALLET_FIELD)?;
        self.backend.remove(DEVICE_KEY_FIELD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_key_is_created_once() {
        let store = KeyStore::in_memory();
        assert!(store.symmetric_key().unwrap().is_none());

        let first = store.get_or_create_symmetric_key().unwrap();
        let second = store.get_or_create_symmetric_key().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_hex().len(), 128);
    }

    #[test]
    fn corrupt_key_is_an_error() {
        let backend = MemoryStore::default();
        backend.set(DEVICE_KEY_FIELD, "not hex").unwrap();
        let store = KeyStore::new(backend);
        assert!(matches!(
            store.get_or_create_symmetric_key(),
            Err(KeyStoreError::CorruptKey(_))
        ));
    }

    #[test]
    fn identity_roundtrip() {
        let store = KeyStore::in_memory();
        store.remember_device_identity("0xAbC").unwrap();
        assert_eq!(
            store.device_identity().unwrap(),
            Some(DeviceIdentity::new("0xAbC"))
        );
        store.forget_device_identity().unwrap();
        assert!(store.device_identity().unwrap().is_none());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let key = {
            let store = KeyStore::open(dir.path());
            store.remember_device_identity("0xabc").unwrap();
            store.get_or_create_symmetric_key().unwrap()
        };

        let reopened = KeyStore::open(dir.path());
        assert_eq!(reopened.symmetric_key().unwrap(), Some(key));
        assert_eq!(
            reopened.device_identity().unwrap(),
            Some(DeviceIdentity::new("0xabc"))
        );

        let text = fs::read_to_string(dir.path().join(STORE_FILE_NAME)).unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();
        assert!(json.get("deviceWallet").is_some());
        assert!(json.get("deviceEncryptionKey").is_some());

        reopened.reset().unwrap();
        assert!(reopened.symmetric_key().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested").join(STORE_FILE_NAME));
        store.set("k", "v").unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
