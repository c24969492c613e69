//! Partition key extraction.
//!
//! A partition spec is an ordered list of rules. Each rule reads one field
//! (possibly nested, by dotted path) and applies a named transform from a
//! closed set. The resulting key maps to a directory path of `name=value`
//! segments in rule order.
//!
//! If any rule cannot produce a value (null source, unsupported value) the
//! key is absent and the record is skipped by partitioned sinks only.

use crate::error::SchemaError;
use crate::record::{DecodedRecord, Value};
use crate::schema::{DataType, Schema};
use chrono::{DateTime, Datelike, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition transforms.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    /// Use the value as-is
    #[default]
    Identity,
    /// Calendar year of a timestamp
    Year,
    /// Month of year (1-12)
    Month,
    /// Day of month (1-31)
    Day,
    /// `YYYY-MM-DD` of a timestamp
    Date,
    /// Hour of day (0-23)
    Hour,
    /// CRC32 of the value's text modulo `num_buckets`
    #[serde(rename = "bucket")]
    Bucket {
        /// Number of buckets
        num_buckets: u32,
    },
    /// Integers floored to a multiple of `width`, strings cut to `width` chars
    #[serde(rename = "truncate")]
    Truncate {
        /// Truncation width
        width: u32,
    },
}

impl Transform {
    /// Name used in error messages.
    pub fn name(&self) -> String {
        match self {
            Transform::Identity => "identity".into(),
            Transform::Year => "year".into(),
            Transform::Month => "month".into(),
            Transform::Day => "day".into(),
            Transform::Date => "date".into(),
            Transform::Hour => "hour".into(),
            Transform::Bucket { num_buckets } => format!("bucket[{}]", num_buckets),
            Transform::Truncate { width } => format!("truncate[{}]", width),
        }
    }

    fn accepts(&self, data_type: DataType) -> bool {
        match self {
            Transform::Identity => data_type != DataType::Nested,
            Transform::Year
            | Transform::Month
            | Transform::Day
            | Transform::Date
            | Transform::Hour => data_type == DataType::Timestamp,
            Transform::Bucket { num_buckets } => {
                *num_buckets > 0 && matches!(data_type, DataType::String | DataType::Integer)
            }
            Transform::Truncate { width } => {
                *width > 0 && matches!(data_type, DataType::String | DataType::Integer)
            }
        }
    }

    /// Apply to a value. `None` when the value is null or unsupported.
    pub fn apply(&self, value: &Value) -> Option<String> {
        match (self, value) {
            (_, Value::Null) => None,
            (Transform::Identity, Value::Struct(_)) => None,
            (Transform::Identity, Value::Timestamp(ts)) => {
                Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            (Transform::Identity, v) => Some(v.to_string()),
            (Transform::Year, Value::Timestamp(ts)) => Some(ts.year().to_string()),
            (Transform::Month, Value::Timestamp(ts)) => Some(ts.month().to_string()),
            (Transform::Day, Value::Timestamp(ts)) => Some(ts.day().to_string()),
            (Transform::Date, Value::Timestamp(ts)) => Some(date(ts)),
            (Transform::Hour, Value::Timestamp(ts)) => Some(ts.hour().to_string()),
            (Transform::Bucket { num_buckets }, v @ (Value::String(_) | Value::Integer(_))) => {
                if *num_buckets == 0 {
                    return None;
                }
                let hash = crc32fast::hash(v.to_string().as_bytes());
                Some((hash % num_buckets).to_string())
            }
            (Transform::Truncate { width }, Value::Integer(i)) if *width > 0 => {
                let w = i64::from(*width);
                Some((i - i.rem_euclid(w)).to_string())
            }
            (Transform::Truncate { width }, Value::String(s)) if *width > 0 => {
                Some(s.chars().take(*width as usize).collect())
            }
            _ => None,
        }
    }
}

fn date(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

/// One partition rule as configured.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PartitionRule {
    /// Directory key name, defaults to the source field
    #[serde(default)]
    pub name: Option<String>,

    /// Source field, dotted for nested fields
    pub source: String,

    /// Transform applied to the source value
    #[serde(default)]
    pub transform: Transform,
}

impl PartitionRule {
    /// Partition on a field verbatim.
    pub fn identity(source: impl Into<String>) -> Self {
        Self {
            name: None,
            source: source.into(),
            transform: Transform::Identity,
        }
    }

    /// Partition on a derived value under a new key name.
    pub fn derived(name: impl Into<String>, source: impl Into<String>, transform: Transform) -> Self {
        Self {
            name: Some(name.into()),
            source: source.into(),
            transform,
        }
    }

    pub fn key_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.source)
    }
}

/// Ordered partition rules, validated against a schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionSpec {
    rules: Vec<PartitionRule>,
}

impl PartitionSpec {
    /// An empty spec: every record maps to the root directory.
    pub fn unpartitioned() -> Self {
        Self::default()
    }

    /// Validate rules against the schema.
    pub fn new(rules: Vec<PartitionRule>, schema: &Schema) -> Result<Self, SchemaError> {
        let mut names = std::collections::HashSet::new();
        for rule in &rules {
            let (_, field) = schema
                .resolve(&rule.source)
                .ok_or_else(|| SchemaError::UnknownField(rule.source.clone()))?;
            if !rule.transform.accepts(field.data_type) {
                return Err(SchemaError::IncompatibleTransform {
                    field: rule.source.clone(),
                    transform: rule.transform.name(),
                    data_type: field.data_type.to_string(),
                });
            }
            let key = rule.key_name();
            if key.is_empty() || key.contains('/') || key.contains('=') {
                return Err(SchemaError::InvalidFieldName(key.to_string()));
            }
            if !names.insert(key.to_string()) {
                return Err(SchemaError::DuplicateField(key.to_string()));
            }
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[PartitionRule] {
        &self.rules
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.rules.is_empty()
    }

    /// Derive the partition key, `None` if any component is absent.
    pub fn extract_key(&self, record: &DecodedRecord) -> Option<PartitionKey> {
        let mut parts = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let value = record.get_path(&rule.source)?;
            let derived = rule.transform.apply(value)?;
            parts.push((rule.key_name().to_string(), derived));
        }
        Some(PartitionKey { parts })
    }
}

/// Derived partition values, in rule order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    parts: Vec<(String, String)>,
}

impl PartitionKey {
    pub fn parts(&self) -> &[(String, String)] {
        &self.parts
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.parts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Directory segments `name=value`, values escaped.
    pub fn segments(&self) -> Vec<String> {
        self.parts
            .iter()
            .map(|(name, value)| format!("{}={}", name, escape_path_value(value)))
            .collect()
    }

    /// Relative directory path, empty for an unpartitioned key.
    pub fn path(&self) -> String {
        self.segments().join("/")
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Percent-escape characters that would break a `name=value` path segment.
pub fn escape_path_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if needs_escape(c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", byte));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn needs_escape(c: char) -> bool {
    c.is_control()
        || matches!(
            c,
            '"' | '#' | '%' | '\'' | '*' | '/' | ':' | '=' | '?' | '\\' | '[' | ']' | '^' | '{'
                | '}' | '<' | '>' | '|'
        )
}
