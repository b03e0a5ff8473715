//! Source record representation.
//!
//! A [`Record`] is the unit of transfer. It is identified at the destination
//! by its natural key plus its temporal key, which makes re-delivery of the
//! same record an overwrite rather than a duplicate.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A typed scalar or binary payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Absent value.
    Null,

    /// Boolean value.
    Bool(bool),

    /// 64-bit signed integer.
    Int(i64),

    /// 64-bit floating point.
    Float(f64),

    /// UTF-8 text.
    Text(String),

    /// Point in time.
    Timestamp(DateTime<Utc>),

    /// Raw bytes. Serialized as lowercase hex in exports.
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
}

impl FieldValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// One source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable natural key.
    pub key: String,

    /// Temporal/ordering key.
    pub timestamp: DateTime<Utc>,

    /// Payload fields. Sorted by name so rendering is deterministic.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create a record with no payload fields.
    pub fn new(key: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Destination document identifier: natural key + temporal key.
    ///
    /// The timestamp is rendered at millisecond precision in UTC so the id is
    /// identical across runs and hosts. Records with finer timestamps are
    /// refused by the transformer, since two of them could share an id.
    pub fn document_id(&self) -> String {
        format!(
            "{}_{}",
            self.key,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    /// Scan-order key: records are ordered by natural key, then temporal key.
    pub fn scan_key(&self) -> (&str, DateTime<Utc>) {
        (self.key.as_str(), self.timestamp)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_document_id_combines_keys() {
        let record = Record::new("thing-42", ts());
        assert_eq!(record.document_id(), "thing-42_2024-03-01T12:30:00.000Z");
    }

    #[test]
    fn test_document_id_distinguishes_timestamps() {
        let a = Record::new("thing-42", ts());
        let b = Record::new("thing-42", ts() + chrono::Duration::milliseconds(1));
        assert_ne!(a.document_id(), b.document_id());
    }

    #[test]
    fn test_record_json_line_format() {
        let record = Record::new("t1", ts())
            .with_field("model_id", 7i64)
            .with_field("iv", vec![0xde, 0xad])
            .with_field("geo", FieldValue::Null);

        let line = serde_json::to_string(&record).unwrap();
        assert!(line.contains(r#""iv":{"type":"bytes","value":"dead"}"#));
        assert!(line.contains(r#""geo":{"type":"null"}"#));

        let parsed: Record = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_option_into_field_value() {
        let none: Option<Vec<u8>> = None;
        assert!(FieldValue::from(none).is_null());
        assert_eq!(FieldValue::from(Some(3i64)), FieldValue::Int(3));
    }
}
