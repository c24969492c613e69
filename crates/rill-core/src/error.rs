//! Error types for the rill core library.
//!
//! Errors are hierarchical: each pipeline stage has its own enum and the
//! top-level [`Error`] wraps them, so callers can match on the stage that
//! failed and the scheduler can decide which failures are retryable.

use thiserror::Error;

/// Result type alias for rill operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for rill.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source polling error
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Sink write or publish error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Checkpoint log error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Schema definition error
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Query parse or evaluation error
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stream scheduler reached the failed state
    #[error("Stream failed: {0}")]
    StreamFailed(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Errors raised while polling a source.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Poll did not complete within the configured timeout
    #[error("Poll timed out after {0}ms")]
    Timeout(u64),

    /// Connectivity failure talking to the source
    #[error("Connection failed to {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    /// Underlying read failure
    #[error("Read failed: {0}")]
    Io(String),

    /// Source was closed and will not produce more records
    #[error("Source closed")]
    Closed,
}

impl SourceError {
    /// Whether the scheduler should retry the poll with the same offset.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::Closed)
    }
}

/// Errors raised by sinks.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Writing staged output failed
    #[error("Write failed for sink {sink}: {message}")]
    Write { sink: String, message: String },

    /// Publishing staged output failed
    #[error("Publish failed for sink {sink}: {message}")]
    Publish { sink: String, message: String },

    /// In-memory view hit its configured row bound
    #[error("Capacity exceeded for view {view}: limit {limit} rows")]
    CapacityExceeded { view: String, limit: usize },

    /// Sink refused the batch
    #[error("Batch {batch_id} rejected by sink {sink}: {message}")]
    Rejected {
        sink: String,
        batch_id: u64,
        message: String,
    },
}

impl SinkError {
    /// Whether retrying the same batch could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SinkError::CapacityExceeded { .. })
    }
}

/// Checkpoint log errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Log corrupted
    #[error("Log corrupted in {file} at line {position}: {message}")]
    Corrupted {
        file: String,
        position: u64,
        message: String,
    },

    /// Entry write failed
    #[error("Entry write failed: {0}")]
    WriteFailed(String),

    /// Recovery failed
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// A commit would move the committed offset backwards
    #[error("Non-monotonic commit: offset {attempted} is behind committed offset {committed}")]
    NonMonotonic { committed: u64, attempted: u64 },
}

/// Schema definition errors.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Two fields share a name at the same nesting level
    #[error("Duplicate field name: {0}")]
    DuplicateField(String),

    /// Field referenced by a partition rule or query does not exist
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// Field name is empty or otherwise unusable
    #[error("Invalid field name: {0:?}")]
    InvalidFieldName(String),

    /// Partition transform cannot be applied to the field's type
    #[error("Transform {transform} cannot be applied to field {field} of type {data_type}")]
    IncompatibleTransform {
        field: String,
        transform: String,
        data_type: String,
    },
}

/// Query errors.
#[derive(Error, Debug)]
pub enum QueryError {
    /// Filter expression could not be parsed
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    /// Query names a field the view does not have
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// No view registered under the name
    #[error("View not found: {0}")]
    ViewNotFound(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        Error::Sink(SinkError::Write {
            sink: "object_store".into(),
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let source_err = SourceError::Connection {
            endpoint: "/data/in".into(),
            message: "permission denied".into(),
        };
        let err: Error = source_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_source_error_transience() {
        assert!(SourceError::Timeout(500).is_transient());
        assert!(SourceError::Io("disk".into()).is_transient());
        assert!(!SourceError::Closed.is_transient());
    }

    #[test]
    fn test_sink_error_retryable() {
        let err = SinkError::Write {
            sink: "files".into(),
            message: "disk full".into(),
        };
        assert!(err.is_retryable());

        let err = SinkError::CapacityExceeded {
            view: "weather".into(),
            limit: 10,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_checkpoint_error() {
        let err = CheckpointError::NonMonotonic {
            committed: 10,
            attempted: 5,
        };
        assert!(err.to_string().contains("Non-monotonic"));

        let err: Error = CheckpointError::Corrupted {
            file: "checkpoint-0000000001.jsonl".into(),
            position: 3,
            message: "bad json".into(),
        }
        .into();
        assert!(err.to_string().contains("line 3"));
    }
}
