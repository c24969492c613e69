//! Sinks receiving committed-to-be batches.
//!
//! A sink's `write` is atomic from the scheduler's point of view: it either
//! makes the whole batch visible or returns an error, after which the
//! scheduler calls `abort` and may retry the same batch.

mod columnar;
mod files;
mod view;

pub use columnar::{arrow_schema, to_record_batch};
pub use files::{create_object_store, PartitionedFileSink};
pub use view::{MaterializedView, ViewSnapshot};

use crate::checkpoint::PublishedFile;
use crate::error::SinkError;
use crate::record::Batch;
use async_trait::async_trait;

/// What a sink did with a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkReceipt {
    /// Rows made visible
    pub rows: u64,
    /// Files published, for durable sinks
    pub files: Vec<PublishedFile>,
}

impl SinkReceipt {
    pub fn rows(rows: u64) -> Self {
        Self {
            rows,
            files: Vec::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Destination for decoded batches.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable identifier, unique within a stream; used in checkpoint entries.
    fn id(&self) -> &str;

    /// Whether output survives a restart. Durable sinks are skipped when
    /// replaying a batch they already published.
    fn is_durable(&self) -> bool;

    /// Make every record of the batch visible, or none of them.
    async fn write(&self, batch: &Batch) -> Result<SinkReceipt, SinkError>;

    /// Discard any partial output of a failed write.
    async fn abort(&self, batch_id: u64) -> Result<(), SinkError> {
        let _ = batch_id;
        Ok(())
    }
}
