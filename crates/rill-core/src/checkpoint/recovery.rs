//! Rebuilding stream position from the checkpoint log.
//!
//! Recovery replays every entry in order. The committed offset comes from
//! the last `BatchCommitted` (or `Snapshot`). A `BatchPlanned` with no
//! matching commit is a batch interrupted by a crash; it is returned as
//! [`PendingBatch`] together with the durable sinks that already published
//! it, so the scheduler can re-run it against the remaining sinks only.

use super::entries::{CheckpointEntry, CheckpointRecord, PublishedFile};
use super::log::CheckpointLog;
use crate::error::{CheckpointError, Error, Result};
use crate::record::Offset;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A batch that was planned but never committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    pub batch_id: u64,
    pub start: Offset,
    pub end: Offset,
    pub record_count: u64,
    /// Durable sinks that published this batch before the crash
    pub committed_sinks: BTreeMap<String, Vec<PublishedFile>>,
}

impl PendingBatch {
    /// Whether `sink_id` already published this batch.
    pub fn is_committed_by(&self, sink_id: &str) -> bool {
        self.committed_sinks.contains_key(sink_id)
    }
}

/// State recovered from the checkpoint log.
#[derive(Debug, Default)]
pub struct RecoveryState {
    /// Last committed batch
    pub committed: Option<CheckpointRecord>,

    /// Interrupted batch to replay before polling new records
    pub pending: Option<PendingBatch>,

    /// Batches committed over the stream's lifetime
    pub batches_committed: u64,

    /// Total entries processed
    pub entries_processed: u64,

    /// Whether the last run ended with `StreamStopped`
    pub clean_shutdown: bool,

    /// Error recorded by the last `StreamFailed`, if the stream failed
    pub last_failure: Option<String>,
}

impl RecoveryState {
    /// Recover state from a checkpoint log.
    pub fn recover_from(log: &CheckpointLog) -> Result<Self> {
        info!(dir = %log.dir().display(), "Starting recovery from checkpoint log");

        let state = Self::from_entries(log.read_all_entries()?)?;

        info!(
            entries = %state.entries_processed,
            committed_offset = %state.next_offset(),
            batches_committed = %state.batches_committed,
            pending_batch = ?state.pending.as_ref().map(|p| p.batch_id),
            clean_shutdown = %state.clean_shutdown,
            "Recovery complete"
        );

        Ok(state)
    }

    /// Replay entries in log order.
    pub fn from_entries(entries: impl IntoIterator<Item = CheckpointEntry>) -> Result<Self> {
        let mut state = RecoveryState::default();

        for entry in entries {
            state.entries_processed += 1;

            match entry {
                CheckpointEntry::StreamStarted { .. } => {
                    state.clean_shutdown = false;
                }

                CheckpointEntry::BatchPlanned {
                    batch_id,
                    start,
                    end,
                    record_count,
                    ..
                } => {
                    if state.is_committed(batch_id) {
                        continue;
                    }
                    if let Some(previous) = &state.pending {
                        if previous.batch_id != batch_id {
                            warn!(
                                previous = previous.batch_id,
                                batch_id, "Planned batch superseded before commit"
                            );
                        }
                    }
                    state.pending = Some(PendingBatch {
                        batch_id,
                        start,
                        end,
                        record_count,
                        committed_sinks: BTreeMap::new(),
                    });
                }

                CheckpointEntry::SinkCommitted {
                    batch_id,
                    sink_id,
                    files,
                    ..
                } => {
                    if let Some(pending) = state.pending.as_mut() {
                        if pending.batch_id == batch_id {
                            pending.committed_sinks.insert(sink_id, files);
                        }
                    }
                }

                entry @ CheckpointEntry::BatchCommitted { .. } => {
                    if let Some(record) = entry.as_record() {
                        state.apply_commit(record)?;
                        state.batches_committed += 1;
                    }
                }

                CheckpointEntry::Snapshot {
                    committed,
                    batches_committed,
                    ..
                } => {
                    if let Some(record) = committed {
                        let is_new = state
                            .committed
                            .as_ref()
                            .map_or(true, |c| c.batch_id != record.batch_id);
                        if is_new {
                            state.apply_commit(record)?;
                        }
                    }
                    state.batches_committed = batches_committed;
                }

                CheckpointEntry::StreamStopped { .. } => {
                    state.clean_shutdown = true;
                }

                CheckpointEntry::StreamFailed { error, .. } => {
                    state.clean_shutdown = false;
                    state.last_failure = Some(error);
                }
            }
        }

        Ok(state)
    }

    fn apply_commit(&mut self, record: CheckpointRecord) -> Result<()> {
        if let Some(prev) = &self.committed {
            if record.end_offset < prev.end_offset {
                return Err(Error::Checkpoint(CheckpointError::NonMonotonic {
                    committed: prev.end_offset.0,
                    attempted: record.end_offset.0,
                }));
            }
        }
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.batch_id <= record.batch_id)
        {
            self.pending = None;
        }
        self.committed = Some(record);
        Ok(())
    }

    fn is_committed(&self, batch_id: u64) -> bool {
        self.committed
            .as_ref()
            .is_some_and(|c| batch_id <= c.batch_id)
    }

    /// Offset to resume polling from.
    pub fn next_offset(&self) -> Offset {
        self.committed
            .as_ref()
            .map_or(Offset::ZERO, |c| c.end_offset)
    }

    /// Identifier for the next batch.
    pub fn next_batch_id(&self) -> u64 {
        self.committed.as_ref().map_or(0, |c| c.batch_id + 1)
    }

    /// Whether an interrupted batch must be replayed.
    pub fn needs_replay(&self) -> bool {
        self.pending.is_some()
    }

    /// Get a summary of the recovery state for logging.
    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            entries_processed: self.entries_processed,
            committed_offset: self.next_offset().0,
            last_batch_id: self.committed.as_ref().map(|c| c.batch_id),
            batches_committed: self.batches_committed,
            pending_batch: self.pending.as_ref().map(|p| p.batch_id),
            pending_committed_sinks: self
                .pending
                .as_ref()
                .map(|p| p.committed_sinks.keys().cloned().collect())
                .unwrap_or_default(),
            clean_shutdown: self.clean_shutdown,
            last_failure: self.last_failure.clone(),
        }
    }
}

/// Summary of recovery state for logging and reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RecoverySummary {
    /// Number of log entries processed
    pub entries_processed: u64,
    /// Offset the stream resumes from
    pub committed_offset: u64,
    /// Last committed batch
    pub last_batch_id: Option<u64>,
    /// Batches committed over the stream's lifetime
    pub batches_committed: u64,
    /// Interrupted batch, if any
    pub pending_batch: Option<u64>,
    /// Sinks that already published the interrupted batch
    pub pending_committed_sinks: Vec<String>,
    /// Whether the last run stopped cleanly
    pub clean_shutdown: bool,
    /// Last recorded failure
    pub last_failure: Option<String>,
}
