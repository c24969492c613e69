//! Records flowing through a stream: raw payloads, typed values, batches.

use crate::schema::Schema;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Position of a record in a source. Monotonically increasing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    pub fn next(self) -> Offset {
        Offset(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(v: u64) -> Self {
        Offset(v)
    }
}

/// An undecoded record as delivered by a source.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub offset: Offset,
    pub payload: Bytes,
    /// When the source first saw the record
    pub arrival: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(offset: Offset, payload: impl Into<Bytes>) -> Self {
        Self {
            offset,
            payload: payload.into(),
            arrival: Utc::now(),
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Timestamp(DateTime<Utc>),
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Nested object, children in schema order
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to a JSON value. Timestamps render as RFC 3339 in UTC.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Struct(children) => serde_json::Value::Object(
                children
                    .iter()
                    .map(|(name, v)| (name.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Nested child by name.
    pub fn child(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(children) => children.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::String(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Struct(_) => write!(f, "{}", self.to_json()),
        }
    }
}

/// A record after the schema has been applied.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub schema: Arc<Schema>,
    /// One value per top-level schema field, in schema order
    pub values: Vec<Value>,
    pub offset: Offset,
    /// Set when the payload could not be parsed at all
    pub decode_error: Option<String>,
}

impl DecodedRecord {
    /// Top-level value by field name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    /// Value by dotted path, `None` if the path is not in the schema.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if !path.contains('.') {
            return self.get(path);
        }
        let (chain, _) = self.schema.resolve(path)?;
        let mut value = self.values.get(chain[0])?;
        for idx in &chain[1..] {
            value = match value {
                Value::Struct(children) => &children.get(*idx)?.1,
                _ => return Some(&Value::Null),
            };
        }
        Some(value)
    }

    pub fn is_malformed(&self) -> bool {
        self.decode_error.is_some()
    }

    /// JSON object in schema order, with `_decode_error` for malformed records.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.values.len() + 1);
        for (field, value) in self.schema.fields().iter().zip(&self.values) {
            map.insert(field.name.clone(), value.to_json());
        }
        if let Some(err) = &self.decode_error {
            map.insert(
                "_decode_error".to_string(),
                serde_json::Value::String(err.clone()),
            );
        }
        serde_json::Value::Object(map)
    }
}

/// A contiguous slice of a source, the unit of scheduling and commit.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Sequential per stream, starting at 0
    pub id: u64,
    /// First offset covered (inclusive)
    pub start: Offset,
    /// One past the last offset covered
    pub end: Offset,
    pub records: Arc<[DecodedRecord]>,
    /// Records whose payload could not be parsed
    pub decode_failures: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
