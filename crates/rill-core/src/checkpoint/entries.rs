//! Checkpoint log entry types.
//!
//! Every batch goes through `BatchPlanned`, zero or more `SinkCommitted`,
//! then `BatchCommitted`. Only `BatchCommitted` advances the stream's
//! committed offset.

use crate::record::Offset;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A checkpoint log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CheckpointEntry {
    /// Scheduler started and recovered its position
    StreamStarted {
        /// Stream identifier
        stream_id: String,
        /// Offset the stream resumes polling from
        resume_offset: Offset,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Batch range fixed before any sink sees it
    BatchPlanned {
        /// Batch identifier
        batch_id: u64,
        /// First offset (inclusive)
        start: Offset,
        /// One past the last offset
        end: Offset,
        /// Records in the range
        record_count: u64,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// A durable sink published its output for a batch
    SinkCommitted {
        /// Batch identifier
        batch_id: u64,
        /// Sink identifier
        sink_id: String,
        /// Files made visible by the sink
        files: Vec<PublishedFile>,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// All sinks accepted the batch; the committed offset advances
    BatchCommitted {
        /// Batch identifier
        batch_id: u64,
        /// New committed offset
        end_offset: Offset,
        /// Per-sink commit state
        sinks: BTreeMap<String, bool>,
        /// Records in the batch
        record_count: u64,
        /// Time from poll to commit
        duration_ms: u64,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Committed state carried into a new log file on rotation
    Snapshot {
        /// Snapshot identifier
        snapshot_id: String,
        /// Last committed batch, if any
        committed: Option<CheckpointRecord>,
        /// Batches committed over the stream's lifetime
        batches_committed: u64,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Scheduler reached `Stopped`
    StreamStopped {
        /// Offset committed at stop
        committed_offset: Offset,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Scheduler reached `Failed`
    StreamFailed {
        /// Failure message
        error: String,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },
}

/// Durable commit state of the last committed batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    /// Last committed batch
    pub batch_id: u64,
    /// Committed offset: everything below it has been applied
    pub end_offset: Offset,
    /// Sink id to committed flag
    pub sinks: BTreeMap<String, bool>,
    /// When the batch was committed
    pub committed_at: DateTime<Utc>,
}

/// A file made visible by a durable sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedFile {
    /// Path relative to the sink root
    pub path: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Rows in the file
    pub row_count: u64,
    /// CRC32 of the file contents, hex
    pub checksum: String,
}

impl CheckpointEntry {
    /// Get the timestamp of this entry.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CheckpointEntry::StreamStarted { timestamp, .. }
            | CheckpointEntry::BatchPlanned { timestamp, .. }
            | CheckpointEntry::SinkCommitted { timestamp, .. }
            | CheckpointEntry::BatchCommitted { timestamp, .. }
            | CheckpointEntry::Snapshot { timestamp, .. }
            | CheckpointEntry::StreamStopped { timestamp, .. }
            | CheckpointEntry::StreamFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the batch ID if this entry has one.
    pub fn batch_id(&self) -> Option<u64> {
        match self {
            CheckpointEntry::BatchPlanned { batch_id, .. }
            | CheckpointEntry::SinkCommitted { batch_id, .. }
            | CheckpointEntry::BatchCommitted { batch_id, .. } => Some(*batch_id),
            _ => None,
        }
    }

    /// Entry type name as written in the log.
    pub fn type_name(&self) -> &'static str {
        match self {
            CheckpointEntry::StreamStarted { .. } => "StreamStarted",
            CheckpointEntry::BatchPlanned { .. } => "BatchPlanned",
            CheckpointEntry::SinkCommitted { .. } => "SinkCommitted",
            CheckpointEntry::BatchCommitted { .. } => "BatchCommitted",
            CheckpointEntry::Snapshot { .. } => "Snapshot",
            CheckpointEntry::StreamStopped { .. } => "StreamStopped",
            CheckpointEntry::StreamFailed { .. } => "StreamFailed",
        }
    }

    pub fn is_batch_committed(&self) -> bool {
        matches!(self, CheckpointEntry::BatchCommitted { .. })
    }

    /// The commit record carried by a `BatchCommitted` entry.
    pub fn as_record(&self) -> Option<CheckpointRecord> {
        match self {
            CheckpointEntry::BatchCommitted {
                batch_id,
                end_offset,
                sinks,
                timestamp,
                ..
            } => Some(CheckpointRecord {
                batch_id: *batch_id,
                end_offset: *end_offset,
                sinks: sinks.clone(),
                committed_at: *timestamp,
            }),
            _ => None,
        }
    }
}
