//! Opaque record payload

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Application data carried by a record. The engine never interprets it beyond
/// checksumming, diffing and overlaying.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// Empty payload used for tombstones
    pub const fn null() -> Self {
        Self(Value::Null)
    }

    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// JSON encoding with object keys sorted at every depth
    pub fn canonical_json(&self) -> String {
        let mut out = String::new();
        write_canonical(&self.0, &mut out);
        out
    }

    /// Lowercase hex SHA-256 of the canonical encoding
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_json().as_bytes()))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        payload.0
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let payload = Payload::new(json!({"b": 1, "a": {"z": true, "y": [3, {"d": 1, "c": 2}]}}));
        assert_eq!(
            payload.canonical_json(),
            r#"{"a":{"y":[3,{"c":2,"d":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn checksum_ignores_key_order() {
        let left = Payload::new(json!({"theme": "dark", "fontSize": 14}));
        let right = Payload::new(json!({"fontSize": 14, "theme": "dark"}));
        assert_eq!(left.checksum(), right.checksum());
        assert_eq!(left.checksum().len(), 64);
    }

    #[test]
    fn checksum_changes_with_content() {
        let left = Payload::new(json!({"theme": "dark"}));
        let right = Payload::new(json!({"theme": "light"}));
        assert_ne!(left.checksum(), right.checksum());
    }

    #[test]
    fn canonical_json_escapes_keys() {
        let payload = Payload::new(json!({"quote\"key": "value"}));
        assert_eq!(payload.canonical_json(), r#"{"quote\"key":"value"}"#);
    }
}
