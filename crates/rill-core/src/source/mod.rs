//! Micro-batch sources.
//!
//! A source hands out raw records by offset. Polling is idempotent for a
//! given starting offset, so the scheduler can re-poll a range after a
//! failure or a restart and get the same records back.

mod directory;
mod memory;
mod retry;

pub use directory::DirectorySource;
pub use memory::MemorySource;
pub use retry::RetryConfig;

use crate::error::SourceError;
use crate::record::{Offset, RawRecord};
use async_trait::async_trait;

/// Records returned by one poll.
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    /// Records with offsets `>= since`, in offset order
    pub records: Vec<RawRecord>,
    /// One past the last returned record, or `since` when empty
    pub next_offset: Offset,
}

impl PollResult {
    pub fn empty(since: Offset) -> Self {
        Self {
            records: Vec::new(),
            next_offset: since,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A pollable record source.
#[async_trait]
pub trait Source: Send + Sync {
    /// Short name for logs and health reporting.
    fn name(&self) -> &str;

    /// Return up to `max_records` records starting at `since`.
    ///
    /// Returns an empty result, not an error, when nothing is available.
    async fn poll(&self, since: Offset, max_records: usize) -> Result<PollResult, SourceError>;

    /// Offset one past the newest record currently available, if known.
    async fn latest_offset(&self) -> Result<Option<Offset>, SourceError> {
        Ok(None)
    }
}
