//! Durable record of stream progress.
//!
//! The checkpoint store provides:
//! - Write-ahead batch planning so an interrupted batch is replayed exactly
//! - Per-sink commit markers for durable sinks
//! - Monotonic committed offsets
//! - Log rotation with snapshots

mod entries;
mod log;
mod recovery;

pub use entries::{CheckpointEntry, CheckpointRecord, PublishedFile};
pub use log::{read_entries, CheckpointLog};
pub use recovery::{PendingBatch, RecoveryState, RecoverySummary};

use crate::Result;

/// Storage for checkpoint entries of a single stream.
///
/// `append` must not return until the entry is durable.
pub trait CheckpointStore: Send + Sync {
    /// Rebuild the stream's position from stored entries.
    fn recover(&self) -> Result<RecoveryState>;

    /// Durably append one entry.
    fn append(&self, entry: CheckpointEntry) -> Result<()>;
}
