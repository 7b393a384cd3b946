//! Structured, JSON-like values that travel across the wire between the
//! pool and a worker, plus the one non-JSON payload shape the protocol
//! needs: a transferable binary region.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A dynamically typed value carried by `Envelope::Request.params`,
/// `Envelope::Response.result` and `Envelope::Event.payload`.
///
/// Method arguments and results have no compile-time type in this
/// dynamic method registry — everything is one of these variants.
/// `Bytes` is the transferable binary region: a `bytes::Bytes` handle
/// rather than `Vec<u8>` so that cloning a `Value` never implies copying
/// the underlying buffer, which matters for the zero-copy story even
/// before a `WorkerChannel` decides whether it can truly move ownership
/// across the isolate boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    #[serde(with = "bytes_as_vec")]
    Bytes(Bytes),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Encodes `bytes::Bytes` as a JSON array of byte values so `Value` needs
/// no extra dependency (e.g. base64) to stay transport-agnostic.
mod bytes_as_vec {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw: Vec<u8> = Vec::deserialize(deserializer)?;
        Ok(Bytes::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let value = Value::Object(vec![
            ("status".into(), Value::String("in_progress".into())),
            ("detail".into(), Value::Number(4.0)),
            ("blob".into(), Value::Bytes(Bytes::from_static(b"abc"))),
        ]);
        let encoded = serde_json::to_vec(&value).unwrap();
        let decoded: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn null_round_trips() {
        let encoded = serde_json::to_string(&Value::Null).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, Value::Null);
    }
}
