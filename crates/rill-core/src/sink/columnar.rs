//! Arrow conversion for columnar output.

use crate::record::{DecodedRecord, Value};
use crate::schema::{DataType, Schema};
use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow::datatypes::{
    DataType as ArrowDataType, Field as ArrowField, Schema as ArrowSchema, SchemaRef, TimeUnit,
};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Column holding the decode failure message of malformed records.
pub const DECODE_ERROR_COLUMN: &str = "_decode_error";

/// Arrow schema for a stream schema. Every column is nullable; nested
/// fields are stored as JSON text.
pub fn arrow_schema(schema: &Schema) -> SchemaRef {
    let mut fields: Vec<ArrowField> = schema
        .fields()
        .iter()
        .map(|f| ArrowField::new(&f.name, arrow_type(f.data_type), true))
        .collect();
    fields.push(ArrowField::new(DECODE_ERROR_COLUMN, ArrowDataType::Utf8, true));
    Arc::new(ArrowSchema::new(fields))
}

fn arrow_type(data_type: DataType) -> ArrowDataType {
    match data_type {
        DataType::Timestamp => ArrowDataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        DataType::String | DataType::Nested => ArrowDataType::Utf8,
        DataType::Integer => ArrowDataType::Int64,
        DataType::Float => ArrowDataType::Float64,
        DataType::Boolean => ArrowDataType::Boolean,
    }
}

/// Build a record batch from decoded records, in schema column order.
pub fn to_record_batch(
    schema: &Schema,
    records: &[&DecodedRecord],
) -> Result<RecordBatch, ArrowError> {
    let capacity = records.len();
    let mut columns: Vec<ColumnBuilder> = schema
        .fields()
        .iter()
        .map(|f| ColumnBuilder::new(f.data_type, capacity))
        .collect();
    let mut errors = StringBuilder::with_capacity(capacity, 0);

    for record in records {
        for (column, value) in columns.iter_mut().zip(&record.values) {
            column.append(value);
        }
        errors.append_option(record.decode_error.as_deref());
    }

    let mut arrays: Vec<ArrayRef> = columns.iter_mut().map(ColumnBuilder::finish).collect();
    arrays.push(Arc::new(errors.finish()));

    RecordBatch::try_new(arrow_schema(schema), arrays)
}

enum ColumnBuilder {
    Timestamp(TimestampMicrosecondBuilder),
    Utf8(StringBuilder),
    Json(StringBuilder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    Boolean(BooleanBuilder),
}

impl ColumnBuilder {
    fn new(data_type: DataType, capacity: usize) -> Self {
        match data_type {
            DataType::Timestamp => ColumnBuilder::Timestamp(
                TimestampMicrosecondBuilder::with_capacity(capacity).with_timezone("UTC"),
            ),
            DataType::String => ColumnBuilder::Utf8(StringBuilder::with_capacity(capacity, 0)),
            DataType::Nested => ColumnBuilder::Json(StringBuilder::with_capacity(capacity, 0)),
            DataType::Integer => ColumnBuilder::Int64(Int64Builder::with_capacity(capacity)),
            DataType::Float => ColumnBuilder::Float64(Float64Builder::with_capacity(capacity)),
            DataType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
        }
    }

    /// Values of the wrong variant are written as null.
    fn append(&mut self, value: &Value) {
        match (self, value) {
            (ColumnBuilder::Timestamp(b), Value::Timestamp(ts)) => {
                b.append_value(ts.timestamp_micros())
            }
            (ColumnBuilder::Utf8(b), Value::String(s)) => b.append_value(s),
            (ColumnBuilder::Json(b), Value::Struct(_)) => {
                b.append_value(value.to_json().to_string())
            }
            (ColumnBuilder::Int64(b), Value::Integer(i)) => b.append_value(*i),
            (ColumnBuilder::Float64(b), Value::Float(f)) => b.append_value(*f),
            (ColumnBuilder::Boolean(b), Value::Boolean(v)) => b.append_value(*v),
            (ColumnBuilder::Timestamp(b), _) => b.append_null(),
            (ColumnBuilder::Utf8(b), _) | (ColumnBuilder::Json(b), _) => b.append_null(),
            (ColumnBuilder::Int64(b), _) => b.append_null(),
            (ColumnBuilder::Float64(b), _) => b.append_null(),
            (ColumnBuilder::Boolean(b), _) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Timestamp(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(b) | ColumnBuilder::Json(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
        }
    }
}
