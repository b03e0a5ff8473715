//! Record to destination document mapping.
//!
//! The transformer is a pure function: no I/O, and the same record always
//! renders the same document byte for byte. Re-delivery relies on upsert by
//! identity, not on content diffing, so this stability matters.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{FieldValue, Record};
use crate::error::{MigrateError, Result};

/// Field carrying the natural key in every document.
pub const KEY_FIELD: &str = "key";

/// Field carrying the temporal key in every document.
pub const TIMESTAMP_FIELD: &str = "date_time";

/// Text representation used for binary payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryEncoding {
    /// Lowercase hexadecimal.
    #[default]
    Hex,

    /// Standard base64 with padding.
    Base64,

    /// Interpret the bytes as UTF-8 text. Invalid UTF-8 is a transform error.
    Utf8,
}

impl BinaryEncoding {
    fn encode(self, record_id: &str, field: &str, bytes: &[u8]) -> Result<String> {
        match self {
            BinaryEncoding::Hex => Ok(hex::encode(bytes)),
            BinaryEncoding::Base64 => Ok(STANDARD.encode(bytes)),
            BinaryEncoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| {
                MigrateError::transform(record_id, format!("field '{}' is not UTF-8: {}", field, e))
            }),
        }
    }
}

/// A document in the destination's wire format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationDoc {
    /// Upsert identifier (natural key + temporal key).
    pub id: String,

    /// Document body. `serde_json::Map` is sorted, so rendering is stable.
    pub body: Map<String, Value>,
}

impl DestinationDoc {
    /// Render the body as compact JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.body)?)
    }
}

/// Maps source records to destination documents.
#[derive(Debug, Clone, Default)]
pub struct DocTransformer {
    /// Declared binary fields and their encoding. Declared fields are always
    /// present in the output, as `null` when absent or null in the record.
    binary_fields: BTreeMap<String, BinaryEncoding>,

    /// Encoding for binary values in undeclared fields.
    default_encoding: BinaryEncoding,
}

impl DocTransformer {
    /// Create a transformer with hex as the default binary encoding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a binary field with its encoding.
    #[must_use]
    pub fn with_binary_field(mut self, name: impl Into<String>, encoding: BinaryEncoding) -> Self {
        self.binary_fields.insert(name.into(), encoding);
        self
    }

    /// Declare several binary fields.
    #[must_use]
    pub fn with_binary_fields(mut self, fields: &BTreeMap<String, BinaryEncoding>) -> Self {
        self.binary_fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), *v)));
        self
    }

    /// Set the encoding for binary values in undeclared fields.
    #[must_use]
    pub fn with_default_encoding(mut self, encoding: BinaryEncoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    /// Transform a whole page. Fails on the first record that cannot be mapped.
    pub fn transform(&self, records: &[Record]) -> Result<Vec<DestinationDoc>> {
        records.iter().map(|r| self.transform_one(r)).collect()
    }

    /// Transform a single record.
    pub fn transform_one(&self, record: &Record) -> Result<DestinationDoc> {
        let id = record.document_id();
        if record.timestamp.timestamp_subsec_nanos() % 1_000_000 != 0 {
            // Ids carry millisecond precision; finer timestamps would share an id.
            return Err(MigrateError::transform(
                &id,
                format!(
                    "timestamp {} has sub-millisecond precision",
                    record.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
                ),
            ));
        }
        let mut body = Map::new();

        body.insert(KEY_FIELD.to_string(), Value::String(record.key.clone()));
        body.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        for (name, value) in &record.fields {
            if name == KEY_FIELD || name == TIMESTAMP_FIELD {
                return Err(MigrateError::transform(
                    &id,
                    format!("payload field '{}' collides with a key field", name),
                ));
            }
            let encoding = self
                .binary_fields
                .get(name)
                .copied()
                .unwrap_or(self.default_encoding);
            body.insert(name.clone(), self.render(&id, name, value, encoding)?);
        }

        for name in self.binary_fields.keys() {
            body.entry(name.clone()).or_insert(Value::Null);
        }

        Ok(DestinationDoc { id, body })
    }

    fn render(
        &self,
        id: &str,
        field: &str,
        value: &FieldValue,
        encoding: BinaryEncoding,
    ) -> Result<Value> {
        Ok(match value {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(v) => Value::Bool(*v),
            FieldValue::Int(v) => Value::from(*v),
            FieldValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .ok_or_else(|| {
                    MigrateError::transform(id, format!("field '{}' is not a finite number", field))
                })?,
            FieldValue::Text(v) => Value::String(v.clone()),
            FieldValue::Timestamp(v) => {
                Value::String(v.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            FieldValue::Bytes(v) => Value::String(encoding.encode(id, field, v)?),
        })
    }
}
