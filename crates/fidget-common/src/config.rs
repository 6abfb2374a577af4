//! Link configuration.
//!
//! Defaults match the device firmware's expectations. A JSON file may
//! override any subset of fields, and `FIDGET_*` environment variables
//! override the file.

use fidget_core::DEFAULT_BAUD_RATE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::helpers::parse_bool;

pub const ENV_PORT: &str = "FIDGET_PORT";
pub const ENV_BAUD_RATE: &str = "FIDGET_BAUD_RATE";
pub const ENV_SECRET_PHRASE: &str = "FIDGET_SECRET_PHRASE";
pub const ENV_STRICT_ACKS: &str = "FIDGET_STRICT_ACKS";
pub const ENV_DATA_DIR: &str = "FIDGET_DATA_DIR";

const DATA_DIR_NAME: &str = "smart-fidget";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial port path. The first USB serial port is used when unset.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Phrase mixed into the primary cipher key derivation.
    pub secret_phrase: String,
    /// When false, a provisioning or registration exchange that exhausts its
    /// attempts after receiving some non-error text counts as a success.
    pub strict_acknowledgements: bool,
    /// Directory of the persisted key-value store.
    pub data_dir: Option<PathBuf>,
    pub timings: LinkTimings,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            secret_phrase: String::new(),
            strict_acknowledgements: false,
            data_dir: None,
            timings: LinkTimings::default(),
        }
    }
}

impl LinkConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(Error::serialization)
    }

    pub fn from_env() -> Result<Self> {
        Self::default().apply_env_overrides()
    }

    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.trim().is_empty()) {
            self.port = Some(port.trim().to_string());
        }
        if let Some(baud) = lookup(ENV_BAUD_RATE) {
            self.baud_rate = baud
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("{}={:?}: {}", ENV_BAUD_RATE, baud, e)))?;
        }
        if let Some(phrase) = lookup(ENV_SECRET_PHRASE) {
            self.secret_phrase = phrase;
        }
        if let Some(strict) = lookup(ENV_STRICT_ACKS) {
            self.strict_acknowledgements = parse_bool(&strict);
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        Ok(self)
    }

    /// The configured data directory, or `<platform data dir>/smart-fidget`.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join(DATA_DIR_NAME))
            .ok_or_else(|| Error::config("no platform data directory; set FIDGET_DATA_DIR"))
    }
}

/// Timing budgets of the link protocol, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTimings {
    pub provision_attempts: u32,
    pub provision_timeout_ms: u64,
    /// Wait before re-polling after an unrecognized provisioning response.
    pub provision_settle_ms: u64,
    pub registration_attempts: u32,
    pub registration_timeout_ms: u64,
    pub registration_settle_ms: u64,
    /// Window after a registration ack in which `NEED_SYMKEY` may follow.
    pub post_ack_grace_ms: u64,
    /// Window after `Y:` in which `SYMKEY:NEEDED` may follow.
    pub auth_grace_ms: u64,
    pub clock_sync_settle_ms: u64,
    pub disconnect_settle_ms: u64,
    pub cancel_grace_ms: u64,
    pub lock_release_grace_ms: u64,
    pub close_retry_ms: u64,
    pub auto_disconnect_ms: u64,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            provision_attempts: 5,
            provision_timeout_ms: 5_000,
            provision_settle_ms: 1_000,
            registration_attempts: 3,
            registration_timeout_ms: 3_000,
            registration_settle_ms: 500,
            post_ack_grace_ms: 1_000,
            auth_grace_ms: 250,
            clock_sync_settle_ms: 500,
            disconnect_settle_ms: 2_000,
            cancel_grace_ms: 500,
            lock_release_grace_ms: 500,
            close_retry_ms: 500,
            auto_disconnect_ms: 500,
        }
    }
}

impl LinkTimings {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn provision_settle(&self) -> Duration {
        Duration::from_millis(self.provision_settle_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn registration_settle(&self) -> Duration {
        Duration::from_millis(self.registration_settle_ms)
    }

    pub fn post_ack_grace(&self) -> Duration {
        Duration::from_millis(self.post_ack_grace_ms)
    }

    pub fn auth_grace(&self) -> Duration {
        Duration::from_millis(self.auth_grace_ms)
    }

    pub fn clock_sync_settle(&self) -> Duration {
        Duration::from_millis(self.clock_sync_settle_ms)
    }

    pub fn disconnect_settle(&self) -> Duration {
        Duration::from_millis(self.disconnect_settle_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn lock_release_grace(&self) -> Duration {
        Duration::from_millis(self.lock_release_grace_ms)
    }

    pub fn close_retry(&self) -> Duration {
        Duration::from_millis(self.close_retry_ms)
    }

    pub fn auto_disconnect(&self) -> Duration {
        Duration::from_millis(self.auto_disconnect_ms)
    }
}
