//! Declared stream schemas.
//!
//! A schema is an ordered list of named, typed fields. Names are
//! case-sensitive and unique at each nesting level. Once bound to a stream
//! the schema is shared read-only behind an `Arc`.

use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Semantic type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Timestamp,
    String,
    Integer,
    Float,
    Boolean,
    /// Object with its own field list
    Nested,
}

impl DataType {
    /// Lowercase name used in configuration and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Timestamp => "timestamp",
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::Nested => "nested",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single named field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Field {
    /// Field name, matched exactly against payload keys
    pub name: String,

    /// Declared type
    #[serde(rename = "type")]
    pub data_type: DataType,

    /// Child fields, only meaningful for nested fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

impl Field {
    /// Create a scalar field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            fields: Vec::new(),
        }
    }

    /// Create a nested field with the given children.
    pub fn nested(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::Nested,
            fields,
        }
    }
}

/// Ordered, validated set of fields with a name index.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Build a schema, rejecting empty or duplicate names at any level.
    pub fn new(fields: Vec<Field>) -> Result<Self, SchemaError> {
        validate_level(&fields, "")?;
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Ok(Self { fields, index })
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of a top-level field.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Top-level field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index_of(name).map(|i| &self.fields[i])
    }

    /// Resolve a dotted path (`location.city`) to the index chain and the
    /// terminal field.
    pub fn resolve(&self, path: &str) -> Option<(Vec<usize>, &Field)> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut idx = self.index_of(first)?;
        let mut chain = vec![idx];
        let mut field = &self.fields[idx];
        for part in parts {
            idx = field.fields.iter().position(|f| f.name == part)?;
            chain.push(idx);
            field = &field.fields[idx];
        }
        Some((chain, field))
    }

    /// Top-level field names in order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

fn validate_level(fields: &[Field], prefix: &str) -> Result<(), SchemaError> {
    let mut seen = std::collections::HashSet::new();
    for field in fields {
        let qualified = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{}.{}", prefix, field.name)
        };
        if field.name.is_empty() || field.name.contains('.') {
            return Err(SchemaError::InvalidFieldName(qualified));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateField(qualified));
        }
        if field.data_type == DataType::Nested {
            validate_level(&field.fields, &qualified)?;
        }
    }
    Ok(())
}
