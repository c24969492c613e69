//! Read-only projection and filter over materialized views.
//!
//! Queries run against an immutable snapshot of a view, so evaluation never
//! holds a lock that an append would wait on.

mod catalog;
mod parser;

pub use catalog::ViewCatalog;
pub use parser::parse_filter;

use crate::decoder::parse_timestamp;
use crate::error::QueryError;
use crate::record::{DecodedRecord, Value};
use crate::schema::Schema;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Virtual column exposing the decode failure message of a record.
pub const DECODE_ERROR_COLUMN: &str = "_decode_error";

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn matches(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Literal on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl Literal {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Integer(i) => Some(*i as f64),
            Literal::Float(f) => Some(*f),
            Literal::String(s) => s.trim().parse().ok(),
            Literal::Boolean(_) => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Integer(i) => write!(f, "{}", i),
            Literal::Float(v) => write!(f, "{}", v),
            Literal::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// Row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        literal: Literal,
    },
    IsNull(String),
    IsNotNull(String),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CompareOp, literal: Literal) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            literal,
        }
    }

    pub fn equals(column: impl Into<String>, literal: Literal) -> Self {
        Self::compare(column, CompareOp::Eq, literal)
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    fn columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { column, .. }
            | Predicate::IsNull(column)
            | Predicate::IsNotNull(column) => out.push(column),
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.columns(out);
                b.columns(out);
            }
            Predicate::Not(p) => p.columns(out),
        }
    }

    /// Evaluate against one record. Null never satisfies a comparison.
    pub fn evaluate(&self, record: &DecodedRecord) -> bool {
        match self {
            Predicate::Compare {
                column,
                op,
                literal,
            } => column_value(record, column)
                .and_then(|value| compare(&value, literal))
                .is_some_and(|ordering| op.matches(ordering)),
            Predicate::IsNull(column) => column_value(record, column).map_or(true, |v| v.is_null()),
            Predicate::IsNotNull(column) => {
                column_value(record, column).is_some_and(|v| !v.is_null())
            }
            Predicate::And(a, b) => a.evaluate(record) && b.evaluate(record),
            Predicate::Or(a, b) => a.evaluate(record) || b.evaluate(record),
            Predicate::Not(p) => !p.evaluate(record),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare {
                column,
                op,
                literal,
            } => write!(f, "{} {} {}", column, op.symbol(), literal),
            Predicate::IsNull(column) => write!(f, "{} is null", column),
            Predicate::IsNotNull(column) => write!(f, "{} is not null", column),
            Predicate::And(a, b) => write!(f, "({} and {})", a, b),
            Predicate::Or(a, b) => write!(f, "({} or {})", a, b),
            Predicate::Not(p) => write!(f, "not {}", p),
        }
    }
}

fn column_value(record: &DecodedRecord, column: &str) -> Option<Value> {
    if column == DECODE_ERROR_COLUMN {
        return Some(
            record
                .decode_error
                .clone()
                .map_or(Value::Null, Value::String),
        );
    }
    record.get_path(column).cloned()
}

/// Order a field value against a literal, `None` if they are incomparable.
fn compare(value: &Value, literal: &Literal) -> Option<Ordering> {
    match (value, literal) {
        (Value::Null, _) | (Value::Struct(_), _) => None,
        (Value::Integer(v), Literal::Integer(l)) => Some(v.cmp(l)),
        (Value::Integer(v), lit) => (*v as f64).partial_cmp(&lit.as_f64()?),
        (Value::Float(v), lit) => v.partial_cmp(&lit.as_f64()?),
        (Value::String(v), Literal::String(l)) => Some(v.as_str().cmp(l.as_str())),
        (Value::String(v), lit @ (Literal::Integer(_) | Literal::Float(_))) => {
            let parsed: f64 = v.trim().parse().ok()?;
            parsed.partial_cmp(&lit.as_f64()?)
        }
        (Value::String(v), Literal::Boolean(l)) => {
            Some(v.as_str().cmp(if *l { "true" } else { "false" }))
        }
        (Value::Boolean(v), Literal::Boolean(l)) => Some(v.cmp(l)),
        (Value::Boolean(_), _) => None,
        (Value::Timestamp(v), Literal::String(l)) => Some(v.cmp(&parse_timestamp(l)?)),
        (Value::Timestamp(v), Literal::Integer(secs)) => Some(v.timestamp().cmp(secs)),
        (Value::Timestamp(_), _) => None,
    }
}

/// Projection, filter and limit over a view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Columns to return, all top-level fields when empty
    pub projection: Vec<String>,
    pub filter: Option<Predicate>,
    pub limit: Option<usize>,
}

impl Query {
    /// All rows, all columns.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a query from textual parts, as used by the CLI and HTTP API.
    ///
    /// `select` is a comma-separated column list (`*` or empty for all).
    pub fn parse(
        select: Option<&str>,
        filter: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Self, QueryError> {
        let projection = select
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty() && *c != "*")
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let filter = match filter.map(str::trim) {
            Some(expr) if !expr.is_empty() => Some(parse_filter(expr)?),
            _ => None,
        };
        Ok(Self {
            projection,
            filter,
            limit,
        })
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check every referenced column exists and return the output columns.
    pub fn resolve_columns(&self, schema: &Schema) -> Result<Vec<String>, QueryError> {
        let mut referenced: Vec<&str> = self.projection.iter().map(String::as_str).collect();
        if let Some(filter) = &self.filter {
            filter.columns(&mut referenced);
        }
        for column in referenced {
            if column != DECODE_ERROR_COLUMN && schema.resolve(column).is_none() {
                return Err(QueryError::UnknownColumn(column.to_string()));
            }
        }

        if self.projection.is_empty() {
            Ok(schema.field_names().into_iter().map(String::from).collect())
        } else {
            Ok(self.projection.clone())
        }
    }

    /// Evaluate over records in order.
    pub fn execute<'a, I>(&self, schema: &Schema, records: I) -> Result<QueryResult, QueryError>
    where
        I: IntoIterator<Item = &'a DecodedRecord>,
    {
        let columns = self.resolve_columns(schema)?;
        let limit = self.limit.unwrap_or(usize::MAX);

        let rows = records
            .into_iter()
            .filter(|record| self.filter.as_ref().map_or(true, |p| p.evaluate(record)))
            .take(limit)
            .map(|record| project(record, &columns))
            .collect();

        Ok(QueryResult { columns, rows })
    }
}

fn project(record: &DecodedRecord, columns: &[String]) -> serde_json::Value {
    let row = columns
        .iter()
        .map(|column| {
            let value = column_value(record, column).unwrap_or(Value::Null);
            (column.clone(), value.to_json())
        })
        .collect();
    serde_json::Value::Object(row)
}

/// Rows returned by a query, each a JSON object keyed by column.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
