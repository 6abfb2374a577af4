//! Device payload parsing.
//!
//! While streaming, the device emits one JSON document of the form
//! `{"data": [entry, ...], ...}`. The raw buffer may hold partial JSON or
//! leftover handshake text around it, so the document is located by the
//! span from the first `{` to the last `}`.

use serde_json::{Map, Value};

/// Outcome of scanning the raw buffer for a device payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadScan {
    /// No complete object yet. `malformed` holds the parse error when a
    /// brace-delimited span exists but does not parse.
    Pending { malformed: Option<String> },
    /// A JSON object with a `data` array.
    Document(DevicePayload),
    /// A JSON object without a `data` array.
    Opaque,
}

pub fn extract_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

pub fn scan(raw: &str) -> PayloadScan {
    let Some(span) = extract_object(raw) else {
        return PayloadScan::Pending { malformed: None };
    };

    match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(document)) => match DevicePayload::from_document(document) {
            Some(payload) => PayloadScan::Document(payload),
            None => PayloadScan::Opaque,
        },
        Ok(_) => PayloadScan::Opaque,
        Err(e) => PayloadScan::Pending {
            malformed: Some(e.to_string()),
        },
    }
}

/// A parsed device payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePayload {
    document: Map<String, Value>,
}

impl DevicePayload {
    pub fn from_document(document: Map<String, Value>) -> Option<Self> {
        if document.get("data").is_some_and(Value::is_array) {
            Some(Self { document })
        } else {
            None
        }
    }

    pub fn entries(&self) -> &[Value] {
        self.document
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// The same document with its `data` array replaced.
    pub fn with_entries(&self, entries: Vec<Value>) -> Value {
        let mut document = self.document.clone();
        document.insert("data".to_string(), Value::Array(entries));
        Value::Object(document)
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }
}

/// An entry is encrypted when it is flagged `encrypted: true` and carries
/// its ciphertext as a string in `data`.
pub fn is_encrypted_entry(entry: &Value) -> bool {
    entry.get("encrypted") == Some(&Value::Bool(true))
        && entry.get("data").is_some_and(Value::is_string)
}

/// The ciphertext hex of an encrypted entry.
pub fn entry_ciphertext(entry: &Value) -> Option<&str> {
    if is_encrypted_entry(entry) {
        entry.get("data").and_then(Value::as_str)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_json_is_pending() {
        assert_eq!(scan(""), PayloadScan::Pending { malformed: None });
        assert_eq!(
            scan("OK\r\n{\"data\": ["),
            PayloadScan::Pending { malformed: None }
        );
        // An inner closing brace is not enough.
        assert!(matches!(
            scan("{\"data\": [{\"id\": 1}"),
            PayloadScan::Pending { malformed: Some(_) }
        ));
    }

    #[test]
    fn finds_document_between_noise() {
        let scanned = scan("SYMKEY_OK\r\n{\"data\": [{\"id\": 1}], \"count\": 1}\r\n");
        let PayloadScan::Document(payload) = scanned else {
            panic!("expected document");
        };
        assert_eq!(payload.entries().len(), 1);
        assert_eq!(payload.document().get("count"), Some(&json!(1)));
    }

    #[test]
    fn empty_data_array() {
        let PayloadScan::Document(payload) = scan("{\"data\": []}") else {
            panic!("expected document");
        };
        assert!(payload.is_empty());
    }

    #[test]
    fn object_without_data_is_opaque() {
        assert_eq!(scan("{\"status\": \"idle\"}"), PayloadScan::Opaque);
        assert_eq!(scan("{\"data\": \"x\"}"), PayloadScan::Opaque);
    }

    #[test]
    fn with_entries_keeps_other_fields() {
        let PayloadScan::Document(payload) = scan("{\"data\": [1], \"device\": \"f1\"}") else {
            panic!("expected document");
        };
        let rebuilt = payload.with_entries(vec![json!({"id": 0})]);
        assert_eq!(rebuilt, json!({"data": [{"id": 0}], "device": "f1"}));
    }

    #[test]
    fn encrypted_entry_detection() {
        assert!(is_encrypted_entry(&json!({"encrypted": true, "data": "00ff"})));
        assert!(!is_encrypted_entry(&json!({"encrypted": "true", "data": "00ff"})));
        assert!(!is_encrypted_entry(&json!({"encrypted": true, "data": 5})));
        assert!(!is_encrypted_entry(&json!({"min": 60})));
        assert_eq!(
            entry_ciphertext(&json!({"encrypted": true, "data": "abcd"})),
            Some("abcd")
        );
    }
}
