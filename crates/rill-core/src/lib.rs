//! rill core - micro-batch JSON stream ingestion engine
//!
//! This library turns a stream of semi-structured records into:
//!
//! - Typed records via permissive schema application
//! - A queryable in-memory materialized view, readable while ingestion runs
//! - Partitioned output files (`zipcode=12345/hour=14/...`) published atomically
//! - Exactly-once-effect recovery through an append-only checkpoint log

pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod partition;
pub mod query;
pub mod record;
pub mod schema;
pub mod sink;
pub mod source;

// Re-export commonly used types
pub use config::Config;
pub use engine::{start_all, start_stream, StreamBuilder, StreamHandle, StreamProgress, StreamState};
pub use error::{CheckpointError, QueryError, SchemaError, SinkError, SourceError};
pub use error::{Error, Result};
pub use query::{Query, QueryResult, ViewCatalog};
pub use record::{Batch, DecodedRecord, Offset, RawRecord, Value};
pub use schema::{DataType, Field, Schema};
