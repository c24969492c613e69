//! Scheduler states and progress reporting.

use crate::error::Error;
use crate::record::Offset;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Where a stream's scheduler is in its loop.
///
/// `Idle → Polling → Decoding → Sinking → Committing → Idle`. `Failed` can
/// be reached from any non-terminal state, `Stopped` only from `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Polling,
    Decoding,
    Sinking,
    Committing,
    Stopped,
    Failed(String),
}

impl StreamState {
    /// Whether the scheduler has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Polling => "polling",
            StreamState::Decoding => "decoding",
            StreamState::Sinking => "sinking",
            StreamState::Committing => "committing",
            StreamState::Stopped => "stopped",
            StreamState::Failed(_) => "failed",
        }
    }

    /// Error describing why a waiter can no longer be satisfied.
    pub(crate) fn to_error(&self) -> Error {
        match self {
            StreamState::Failed(message) => Error::StreamFailed(message.clone()),
            _ => Error::Shutdown,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Failed(message) => write!(f, "failed: {}", message),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Progress of a stream, updated after recovery and after every commit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamProgress {
    pub stream_id: String,
    /// Last committed batch
    pub batch_id: Option<u64>,
    /// Everything below this offset has been applied to every sink
    pub committed_offset: Offset,
    /// Batches committed by this process
    pub batches_committed: u64,
    /// Records in the last committed batch
    pub last_batch_records: usize,
    /// Malformed records in the last committed batch
    pub last_batch_decode_failures: usize,
    /// Rows each sink accepted for the last committed batch
    pub last_batch_rows: BTreeMap<String, u64>,
    /// Time from poll to commit for the last committed batch
    pub last_batch_duration_ms: u64,
    pub last_committed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(StreamState::Stopped.is_terminal());
        assert!(StreamState::Failed("boom".into()).is_terminal());
        assert!(!StreamState::Idle.is_terminal());
        assert!(!StreamState::Sinking.is_terminal());
    }

    #[test]
    fn test_display_and_error() {
        assert_eq!(StreamState::Committing.to_string(), "committing");
        let failed = StreamState::Failed("disk full".into());
        assert_eq!(failed.to_string(), "failed: disk full");
        assert!(matches!(failed.to_error(), Error::StreamFailed(m) if m == "disk full"));
        assert!(matches!(StreamState::Stopped.to_error(), Error::Shutdown));
    }

    #[test]
    fn test_serialize() {
        let json = serde_json::to_value(StreamState::Failed("x".into())).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"], "x");
        let json = serde_json::to_value(StreamState::Idle).unwrap();
        assert_eq!(json["state"], "idle");
    }
}
