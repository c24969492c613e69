//! In-process source fed by pushing payloads.

use super::{PollResult, Source};
use crate::error::SourceError;
use crate::record::{Offset, RawRecord};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    records: Vec<RawRecord>,
    closed: bool,
    /// Polls that will fail with a connection error before succeeding again
    pending_failures: u32,
    poll_delay: Option<Duration>,
}

/// Append-only in-memory log. Offsets are assigned 0, 1, 2, ...
///
/// Cloning yields another handle to the same log, so a caller can keep
/// pushing after handing the source to a stream.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Append a payload and return its offset.
    pub fn push(&self, payload: impl Into<Bytes>) -> Offset {
        let mut inner = self.inner.lock();
        let offset = Offset(inner.records.len() as u64);
        inner.records.push(RawRecord::new(offset, payload));
        offset
    }

    /// Append a JSON value serialized as the payload.
    pub fn push_json(&self, value: &serde_json::Value) -> Offset {
        self.push(value.to_string())
    }

    /// Append several payloads, returning the offset after the last one.
    pub fn push_all<I, P>(&self, payloads: I) -> Offset
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        let mut last = self.end_offset();
        for payload in payloads {
            last = self.push(payload).next();
        }
        last
    }

    /// Offset one past the newest record.
    pub fn end_offset(&self) -> Offset {
        Offset(self.inner.lock().records.len() as u64)
    }

    /// Make the next `count` polls fail with a connection error.
    pub fn inject_failures(&self, count: u32) {
        self.inner.lock().pending_failures = count;
    }

    /// Delay every poll, e.g. to exercise poll timeouts.
    pub fn set_poll_delay(&self, delay: Option<Duration>) {
        self.inner.lock().poll_delay = delay;
    }

    /// Mark the source as closed; polls then fail permanently.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self, since: Offset, max_records: usize) -> Result<PollResult, SourceError> {
        let delay = self.inner.lock().poll_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SourceError::Closed);
        }
        if inner.pending_failures > 0 {
            inner.pending_failures -= 1;
            return Err(SourceError::Connection {
                endpoint: self.name.clone(),
                message: "injected failure".into(),
            });
        }

        let start = (since.0 as usize).min(inner.records.len());
        let end = start.saturating_add(max_records).min(inner.records.len());
        let records = inner.records[start..end].to_vec();
        let next_offset = records.last().map_or(since, |r| r.offset.next());
        Ok(PollResult {
            records,
            next_offset,
        })
    }

    async fn latest_offset(&self) -> Result<Option<Offset>, SourceError> {
        Ok(Some(self.end_offset()))
    }
}
