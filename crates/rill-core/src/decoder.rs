//! Permissive JSON record decoding.
//!
//! The payload is parsed into a `serde_json::Value` tree and projected onto
//! the declared schema. Each schema field takes the key with exactly the
//! same name. A missing key or a value that does not convert to the declared
//! type becomes `Value::Null`. Keys not in the schema are dropped.
//!
//! A payload that is not a JSON object never fails the batch: every field is
//! null and the record carries the parse error in `decode_error`.

use crate::record::{DecodedRecord, RawRecord, Value};
use crate::schema::{DataType, Field, Schema};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::sync::Arc;
use tracing::debug;

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Applies a schema to raw payloads.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    schema: Arc<Schema>,
}

/// Output of decoding a run of raw records.
#[derive(Debug, Default)]
pub struct DecodeOutput {
    pub records: Vec<DecodedRecord>,
    /// Number of records whose payload could not be parsed
    pub failures: usize,
}

impl RecordDecoder {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Decode a single raw record.
    pub fn decode(&self, raw: &RawRecord) -> DecodedRecord {
        let parsed = serde_json::from_slice::<serde_json::Value>(&raw.payload);
        match parsed {
            Ok(serde_json::Value::Object(map)) => DecodedRecord {
                schema: Arc::clone(&self.schema),
                values: project_fields(self.schema.fields(), &map),
                offset: raw.offset,
                decode_error: None,
            },
            Ok(other) => self.malformed(raw, format!("expected JSON object, got {}", kind(&other))),
            Err(e) => self.malformed(raw, e.to_string()),
        }
    }

    /// Decode records in order, counting malformed payloads.
    pub fn decode_all(&self, raws: &[RawRecord]) -> DecodeOutput {
        let mut out = DecodeOutput {
            records: Vec::with_capacity(raws.len()),
            failures: 0,
        };
        for raw in raws {
            let rec = self.decode(raw);
            if rec.is_malformed() {
                out.failures += 1;
            }
            out.records.push(rec);
        }
        out
    }

    fn malformed(&self, raw: &RawRecord, message: String) -> DecodedRecord {
        debug!(offset = %raw.offset, error = %message, "Malformed payload, null-filling record");
        DecodedRecord {
            schema: Arc::clone(&self.schema),
            values: vec![Value::Null; self.schema.len()],
            offset: raw.offset,
            decode_error: Some(message),
        }
    }
}

fn project_fields(
    fields: &[Field],
    map: &serde_json::Map<String, serde_json::Value>,
) -> Vec<Value> {
    fields
        .iter()
        .map(|field| match map.get(&field.name) {
            Some(json) => convert(field, json),
            None => Value::Null,
        })
        .collect()
}

/// Convert one JSON value to the field's declared type, or null.
pub fn convert(field: &Field, json: &serde_json::Value) -> Value {
    use serde_json::Value as J;

    match (field.data_type, json) {
        (_, J::Null) => Value::Null,

        (DataType::Timestamp, J::String(s)) => parse_timestamp(s).map_or(Value::Null, Value::Timestamp),
        (DataType::Timestamp, J::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map_or(Value::Null, Value::Timestamp),

        (DataType::String, J::String(s)) => Value::String(s.clone()),
        (DataType::String, J::Number(n)) => Value::String(n.to_string()),
        (DataType::String, J::Bool(b)) => Value::String(b.to_string()),

        (DataType::Integer, J::Number(n)) => integer(n).map_or(Value::Null, Value::Integer),

        (DataType::Float, J::Number(n)) => n.as_f64().map_or(Value::Null, Value::Float),

        (DataType::Boolean, J::Bool(b)) => Value::Boolean(*b),

        (DataType::Nested, J::Object(map)) => Value::Struct(
            field
                .fields
                .iter()
                .zip(project_fields(&field.fields, map))
                .map(|(child, value)| (child.name.clone(), value))
                .collect(),
        ),

        _ => Value::Null,
    }
}

/// Whole numbers only; `75.0` is accepted, `75.5` is not.
fn integer(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    // i64::MIN is exactly representable; 2^63 is the first value past i64::MAX.
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < 9_223_372_036_854_775_808.0 {
        Some(f as i64)
    } else {
        None
    }
}

/// Parse RFC 3339, naive date-times (taken as UTC) or bare dates.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Offset;
    use chrono::{TimeZone, Timelike};

    fn weather_decoder() -> RecordDecoder {
        let schema = Schema::new(vec![
            Field::new("timestamp", DataType::Timestamp),
            Field::new("zipcode", DataType::String),
            Field::new("temperature", DataType::Integer),
        ])
        .unwrap();
        RecordDecoder::new(Arc::new(schema))
    }

    fn raw(payload: &str) -> RawRecord {
        RawRecord::new(Offset(0), payload.as_bytes().to_vec())
    }

    #[test]
    fn test_decode_conforming_payload() {
        let decoder = weather_decoder();
        let rec = decoder.decode(&raw(
            r#"{"timestamp":"2018-10-01T14:05:00","zipcode":"12345","temperature":75}"#,
        ));

        assert!(!rec.is_malformed());
        assert_eq!(
            rec.get("timestamp"),
            Some(&Value::Timestamp(
                Utc.with_ymd_and_hms(2018, 10, 1, 14, 5, 0).unwrap()
            ))
        );
        assert_eq!(rec.get("zipcode"), Some(&Value::String("12345".into())));
        assert_eq!(rec.get("temperature"), Some(&Value::Integer(75)));
    }

    #[test]
    fn test_missing_fields_are_null_and_extra_keys_dropped() {
        let decoder = weather_decoder();
        let rec = decoder.decode(&raw(r#"{"zipcode":"22334","humidity":40}"#));

        assert_eq!(rec.values.len(), 3);
        assert_eq!(rec.get("timestamp"), Some(&Value::Null));
        assert_eq!(rec.get("temperature"), Some(&Value::Null));
        assert_eq!(rec.get("humidity"), None);
        assert!(rec.to_json().get("humidity").is_none());
    }

    #[test]
    fn test_type_mismatch_is_null() {
        let decoder = weather_decoder();
        let rec = decoder.decode(&raw(
            r#"{"timestamp":"not a time","zipcode":["a"],"temperature":"hot"}"#,
        ));
        assert!(!rec.is_malformed());
        assert!(rec.values.iter().all(Value::is_null));
    }

    #[test]
    fn test_fractional_number_is_not_integer() {
        let decoder = weather_decoder();
        let rec = decoder.decode(&raw(r#"{"temperature":75.5}"#));
        assert_eq!(rec.get("temperature"), Some(&Value::Null));
    }

    #[test]
    fn test_whole_float_is_integer() {
        let decoder = weather_decoder();
        let rec = decoder.decode(&raw(r#"{"temperature":75.0}"#));
        assert_eq!(rec.get("temperature"), Some(&Value::Integer(75)));

        let rec = decoder.decode(&raw(r#"{"temperature":-3e2}"#));
        assert_eq!(rec.get("temperature"), Some(&Value::Integer(-300)));

        let rec = decoder.decode(&raw(r#"{"temperature":1e19}"#));
        assert_eq!(rec.get("temperature"), Some(&Value::Null));

        let rec = decoder.decode(&raw(r#"{"temperature":18446744073709551615}"#));
        assert_eq!(rec.get("temperature"), Some(&Value::Null));
    }

    #[test]
    fn test_numeric_zipcode_becomes_string() {
        let decoder = weather_decoder();
        let rec = decoder.decode(&raw(r#"{"zipcode":22334}"#));
        assert_eq!(rec.get("zipcode"), Some(&Value::String("22334".into())));
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let decoder = weather_decoder();
        let rec = decoder.decode(&raw(r#"{"ZipCode":"12345"}"#));
        assert_eq!(rec.get("zipcode"), Some(&Value::Null));
    }

    #[test]
    fn test_malformed_payload_is_flagged() {
        let decoder = weather_decoder();
        let out = decoder.decode_all(&[
            raw(r#"{"zipcode":"1"}"#),
            raw("{not json"),
            raw("[1,2,3]"),
        ]);

        assert_eq!(out.records.len(), 3);
        assert_eq!(out.failures, 2);
        assert!(out.records[1].is_malformed());
        assert!(out.records[1].values.iter().all(Value::is_null));
        assert!(out.records[2]
            .decode_error
            .as_deref()
            .unwrap()
            .contains("array"));
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2018, 10, 1, 14, 5, 0).unwrap();
        assert_eq!(parse_timestamp("2018-10-01T14:05:00"), Some(expected));
        assert_eq!(parse_timestamp("2018-10-01 14:05:00"), Some(expected));
        assert_eq!(parse_timestamp("2018-10-01T14:05:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2018-10-01T16:05:00+02:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2018-10-01T14:05:00.250").map(|t| t.nanosecond()),
            Some(250_000_000)
        );
        assert_eq!(
            parse_timestamp("2018-10-01"),
            Some(Utc.with_ymd_and_hms(2018, 10, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_epoch_seconds_timestamp() {
        let field = Field::new("ts", DataType::Timestamp);
        assert_eq!(
            convert(&field, &serde_json::json!(1538402700)),
            Value::Timestamp(Utc.with_ymd_and_hms(2018, 10, 1, 14, 5, 0).unwrap())
        );
    }

    #[test]
    fn test_nested_projection() {
        let field = Field::nested(
            "location",
            vec![
                Field::new("city", DataType::String),
                Field::new("elevation", DataType::Float),
            ],
        );
        let value = convert(
            &field,
            &serde_json::json!({"city": "Austin", "elevation": 149, "country": "US"}),
        );
        assert_eq!(
            value,
            Value::Struct(vec![
                ("city".into(), Value::String("Austin".into())),
                ("elevation".into(), Value::Float(149.0)),
            ])
        );
        assert_eq!(convert(&field, &serde_json::json!("Austin")), Value::Null);
    }

    #[test]
    fn test_boolean_strict() {
        let field = Field::new("ok", DataType::Boolean);
        assert_eq!(convert(&field, &serde_json::json!(true)), Value::Boolean(true));
        assert_eq!(convert(&field, &serde_json::json!("true")), Value::Null);
        assert_eq!(convert(&field, &serde_json::json!(1)), Value::Null);
    }
}
