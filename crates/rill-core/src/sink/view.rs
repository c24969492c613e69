//! In-memory materialized view.
//!
//! Rows are stored as one immutable segment per appended batch. Readers
//! clone the segment list under a read lock and evaluate without holding
//! it, so a query never waits on the scheduler beyond that clone and never
//! observes half a batch.

use super::{Sink, SinkReceipt};
use crate::error::{QueryError, SinkError};
use crate::query::{Query, QueryResult};
use crate::record::{Batch, DecodedRecord};
use crate::schema::Schema;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Append-only table fed by one stream and read by many queries.
pub struct MaterializedView {
    name: String,
    schema: Arc<Schema>,
    segments: RwLock<Vec<Arc<[DecodedRecord]>>>,
    rows: AtomicUsize,
    /// Last batch appended, for idempotent re-delivery
    last_batch: Mutex<Option<u64>>,
    max_rows: Option<usize>,
}

impl MaterializedView {
    pub fn new(name: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            name: name.into(),
            schema,
            segments: RwLock::new(Vec::new()),
            rows: AtomicUsize::new(0),
            last_batch: Mutex::new(None),
            max_rows: None,
        }
    }

    /// Bound the view; an append past the bound fails the stream.
    pub fn with_max_rows(mut self, max_rows: Option<usize>) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Rows visible to queries.
    pub fn row_count(&self) -> usize {
        self.rows.load(Ordering::Acquire)
    }

    /// Last batch id appended, if any.
    pub fn last_batch_id(&self) -> Option<u64> {
        *self.last_batch.lock()
    }

    /// Append a batch. Batches at or below the last appended id are ignored.
    pub fn append(&self, batch: &Batch) -> Result<usize, SinkError> {
        let mut last_batch = self.last_batch.lock();
        if last_batch.is_some_and(|last| batch.id <= last) {
            debug!(view = %self.name, batch_id = batch.id, "Batch already in view, skipping");
            return Ok(0);
        }

        let current = self.row_count();
        if let Some(limit) = self.max_rows {
            if current + batch.len() > limit {
                return Err(SinkError::CapacityExceeded {
                    view: self.name.clone(),
                    limit,
                });
            }
        }

        if !batch.is_empty() {
            self.segments.write().push(batch.records.clone());
            self.rows.store(current + batch.len(), Ordering::Release);
        }
        *last_batch = Some(batch.id);
        Ok(batch.len())
    }

    /// Consistent point-in-time view of all rows.
    pub fn snapshot(&self) -> ViewSnapshot {
        let segments = self.segments.read().clone();
        ViewSnapshot {
            schema: self.schema.clone(),
            segments,
        }
    }

    /// Run a query against a fresh snapshot.
    pub fn query(&self, query: &Query) -> Result<QueryResult, QueryError> {
        self.snapshot().query(query)
    }
}

#[async_trait]
impl Sink for MaterializedView {
    fn id(&self) -> &str {
        "view"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn write(&self, batch: &Batch) -> Result<SinkReceipt, SinkError> {
        let rows = self.append(batch)?;
        debug!(
            view = %self.name,
            batch_id = batch.id,
            rows,
            total_rows = self.row_count(),
            "Appended batch to view"
        );
        Ok(SinkReceipt::rows(rows as u64))
    }
}

/// Rows of a view at one point in time.
#[derive(Clone)]
pub struct ViewSnapshot {
    schema: Arc<Schema>,
    segments: Vec<Arc<[DecodedRecord]>>,
}

impl ViewSnapshot {
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.is_empty())
    }

    /// Records in append order.
    pub fn records(&self) -> impl Iterator<Item = &DecodedRecord> {
        self.segments.iter().flat_map(|s| s.iter())
    }

    pub fn query(&self, query: &Query) -> Result<QueryResult, QueryError> {
        query.execute(&self.schema, self.records())
    }
}
