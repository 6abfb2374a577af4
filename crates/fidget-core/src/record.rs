//! Device identity and decrypted session records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The wallet address a device considers itself bound to.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub wallet_address: String,
}

impl DeviceIdentity {
    pub fn new(wallet_address: impl Into<String>) -> Self {
        Self {
            wallet_address: wallet_address.into(),
        }
    }

    /// Case-insensitive, whitespace-trimmed comparison against a wallet.
    pub fn matches(&self, wallet: &str) -> bool {
        self.wallet_address
            .trim()
            .eq_ignore_ascii_case(wallet.trim())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wallet_address)
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceIdentity({})", self.wallet_address)
    }
}

/// Which key-derivation strategy produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptMethod {
    Standard,
    Simplified,
    PartialFallback,
}

impl DecryptMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Simplified => "simplified",
            Self::PartialFallback => "partial_fallback",
        }
    }
}

/// One unit of sensor-session data from a device payload.
///
/// All measurement fields are optional: a record that failed to decrypt
/// carries `error` and whatever fallback data could be kept. Fields the
/// device sends that are not modelled here are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Press count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u32>,
    /// Counter-clockwise rotation count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccw: Option<u32>,
    /// Clockwise rotation count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cw: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrypt_method: Option<DecryptMethod>,
    /// Decrypted text that was not a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial_json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The untouched payload entry, kept when decryption failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionRecord {
    /// Builds a record from a JSON value, keeping unknown fields.
    ///
    /// Values that do not fit the record shape are kept whole in
    /// `original_data` rather than rejected.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<SessionRecord>(value.clone()) {
            Ok(record) => record,
            Err(_) => Self {
                original_data: Some(value),
                ..Self::default()
            },
        }
    }

    /// Decrypted text that is not a JSON object.
    pub fn raw_text(text: impl Into<String>, method: DecryptMethod) -> Self {
        Self {
            raw_data: Some(text.into()),
            decrypt_method: Some(method),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>, original: Option<Value>) -> Self {
        Self {
            error: Some(error.into()),
            original_data: original,
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_match_ignores_case_and_whitespace() {
        let identity = DeviceIdentity::new("0xAbCdEf");
        assert!(identity.matches(" 0xabcdef\n"));
        assert!(!identity.matches("0xabcdee"));
    }

    #[test]
    fn record_keeps_unknown_fields() {
        let record = SessionRecord::from_value(json!({
            "id": 2,
            "min": 67,
            "max": 90,
            "avg": 78.5,
            "duration": 300000,
            "startTime": "10:30",
            "endTime": "10:35",
            "cw": 8,
            "firmware": "1.2"
        }));
        assert_eq!(record.id, Some(2));
        assert_eq!(record.avg, Some(78.5));
        assert_eq!(record.start_time.as_deref(), Some("10:30"));
        assert_eq!(record.extra.get("firmware"), Some(&json!("1.2")));
        assert!(!record.is_error());

        let value = record.to_value();
        assert_eq!(value["startTime"], json!("10:30"));
        assert_eq!(value["firmware"], json!("1.2"));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn ill_shaped_entry_is_kept_whole() {
        let entry = json!({"min": "sixty"});
        let record = SessionRecord::from_value(entry.clone());
        assert_eq!(record.original_data, Some(entry));
        assert!(!record.is_error());
    }

    #[test]
    fn decrypt_method_wire_names() {
        let record = SessionRecord::raw_text("hello", DecryptMethod::PartialFallback);
        assert_eq!(record.to_value()["decryptMethod"], json!("partial_fallback"));
        assert_eq!(DecryptMethod::Simplified.as_str(), "simplified");
    }
}
