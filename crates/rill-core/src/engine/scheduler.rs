//! The per-stream micro-batch loop.
//!
//! Each iteration polls from the committed offset, decodes the records into
//! a batch, plans the batch in the checkpoint log, hands it to every sink
//! and commits. The committed offset only moves once every sink accepted
//! the batch, so a failure anywhere before the commit leaves the same range
//! to be retried, either in-process or after a restart.

use super::state::{StreamProgress, StreamState};
use crate::checkpoint::{CheckpointEntry, CheckpointStore, PendingBatch, PublishedFile};
use crate::config::SchedulerConfig;
use crate::decoder::RecordDecoder;
use crate::error::{CheckpointError, Error, Result, SinkError, SourceError};
use crate::health::{component_name, HealthCheck};
use crate::metrics::StreamMetrics;
use crate::record::{Batch, Offset, RawRecord};
use crate::sink::{MaterializedView, Sink};
use crate::source::{PollResult, Source};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Poll retries back off up to this exponent and then stay at the cap.
const MAX_POLL_BACKOFF_EXPONENT: u32 = 16;

pub(crate) struct Scheduler {
    pub(crate) stream_id: String,
    pub(crate) source: Arc<dyn Source>,
    pub(crate) decoder: RecordDecoder,
    pub(crate) sinks: Vec<Arc<dyn Sink>>,
    pub(crate) checkpoint: Arc<dyn CheckpointStore>,
    pub(crate) config: SchedulerConfig,
    pub(crate) metrics: Arc<StreamMetrics>,
    pub(crate) health: Arc<HealthCheck>,
    pub(crate) view: Option<Arc<MaterializedView>>,
    pub(crate) state_tx: watch::Sender<StreamState>,
    pub(crate) progress_tx: watch::Sender<StreamProgress>,
    pub(crate) stop: Arc<watch::Sender<bool>>,
    pub(crate) next_offset: Offset,
    pub(crate) next_batch_id: u64,
}

impl Scheduler {
    /// Run until stopped or failed. The final state is published before
    /// this returns.
    pub(crate) async fn run(mut self) -> Result<()> {
        self.health.stream_started(&self.stream_id);
        info!(stream = %self.stream_id, source = %self.source.name(), "Stream started");

        let result = self.run_loop().await;

        match &result {
            Ok(()) => {
                if let Err(e) = self.checkpoint.append(CheckpointEntry::StreamStopped {
                    committed_offset: self.next_offset,
                    timestamp: Utc::now(),
                }) {
                    warn!(stream = %self.stream_id, error = %e, "Failed to record stream stop");
                }
                info!(
                    stream = %self.stream_id,
                    committed_offset = %self.next_offset,
                    "Stream stopped"
                );
                self.set_state(StreamState::Stopped);
            }
            Err(e) => {
                error!(stream = %self.stream_id, error = %e, "Stream failed");
                if let Err(log_err) = self.checkpoint.append(CheckpointEntry::StreamFailed {
                    error: e.to_string(),
                    timestamp: Utc::now(),
                }) {
                    warn!(stream = %self.stream_id, error = %log_err, "Failed to record stream failure");
                }
                self.set_state(StreamState::Failed(e.to_string()));
            }
        }

        self.health.stream_stopped(&self.stream_id);
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.recover().await?;

        loop {
            if self.stop_requested() {
                break;
            }

            self.set_state(StreamState::Polling);
            let started = Instant::now();
            let max_records = self.config.max_records_per_batch;
            let poll = match self.poll(self.next_offset, max_records).await? {
                Some(poll) => poll,
                None => break,
            };

            if poll.is_empty() {
                self.set_state(StreamState::Idle);
                self.update_lag().await;
                if self.wait_or_stop(self.config.poll_interval()).await {
                    break;
                }
                continue;
            }

            let start = self.next_offset;
            let end = poll.next_offset;
            let batch = self.decode(self.next_batch_id, start, end, &poll.records);
            self.plan(&batch).await?;
            self.execute(batch, &BTreeMap::new(), started).await?;
        }

        Ok(())
    }

    /// Restore the committed position and finish any interrupted batch.
    async fn recover(&mut self) -> Result<()> {
        let component = self.component("checkpoint");
        let state = match self.checkpoint.recover() {
            Ok(state) => state,
            Err(e) => {
                self.health
                    .mark_unhealthy(&component, &format!("Recovery failed: {}", e));
                return Err(e);
            }
        };
        self.health.mark_healthy(&component);

        let summary = state.summary();
        info!(
            stream = %self.stream_id,
            entries_processed = summary.entries_processed,
            committed_offset = summary.committed_offset,
            last_batch_id = ?summary.last_batch_id,
            pending_batch = ?summary.pending_batch,
            clean_shutdown = summary.clean_shutdown,
            "Recovery complete"
        );
        if let Some(failure) = &summary.last_failure {
            warn!(stream = %self.stream_id, previous_failure = %failure, "Previous run failed");
        }

        self.next_offset = state.next_offset();
        self.next_batch_id = state.next_batch_id();
        self.metrics.set_committed_offset(self.next_offset.0);
        let committed = state.committed.clone();
        self.progress_tx.send_modify(|p| {
            p.committed_offset = state.next_offset();
            p.batch_id = committed.as_ref().map(|c| c.batch_id);
            p.last_committed_at = committed.as_ref().map(|c| c.committed_at);
        });

        self.append_checkpoint(CheckpointEntry::StreamStarted {
            stream_id: self.stream_id.clone(),
            resume_offset: self.next_offset,
            timestamp: Utc::now(),
        })
        .await?;

        match state.pending {
            Some(pending) => self.replay(pending).await,
            None => Ok(()),
        }
    }

    /// Re-execute a batch that was planned but never committed.
    ///
    /// The same offset range is re-polled and only records below the
    /// planned end are kept, so the batch gets the same id and contents.
    /// Durable sinks that already published it are skipped.
    async fn replay(&mut self, pending: PendingBatch) -> Result<()> {
        warn!(
            stream = %self.stream_id,
            batch_id = pending.batch_id,
            start = %pending.start,
            end = %pending.end,
            committed_sinks = ?pending.committed_sinks.keys().collect::<Vec<_>>(),
            "Replaying interrupted batch"
        );

        let started = Instant::now();
        self.set_state(StreamState::Polling);

        let mut raws: Vec<RawRecord> = Vec::new();
        let mut since = pending.start;
        while since < pending.end {
            let remaining = (pending.end.0 - since.0) as usize;
            let max_records = remaining.min(self.config.max_records_per_batch);
            let poll = match self.poll(since, max_records).await? {
                Some(poll) => poll,
                None => return Ok(()),
            };
            if poll.is_empty() {
                return Err(CheckpointError::RecoveryFailed(format!(
                    "source no longer has offsets {}..{} of batch {}",
                    since, pending.end, pending.batch_id
                ))
                .into());
            }
            since = poll.next_offset;
            raws.extend(poll.records.into_iter().filter(|r| r.offset < pending.end));
        }

        let batch = self.decode(pending.batch_id, pending.start, pending.end, &raws);
        self.execute(batch, &pending.committed_sinks, started).await
    }

    /// Poll `since`, retrying transient failures with backoff.
    ///
    /// Returns `None` if a stop was requested while waiting to retry.
    async fn poll(&self, since: Offset, max_records: usize) -> Result<Option<PollResult>> {
        let component = self.component("source");
        let retry = self.config.retry_config(u32::MAX);
        let mut attempt = 0u32;

        loop {
            let result = tokio::time::timeout(
                self.config.poll_timeout(),
                self.source.poll(since, max_records),
            )
            .await
            .unwrap_or(Err(SourceError::Timeout(self.config.poll_timeout_ms)));

            match result {
                Ok(poll) => {
                    if attempt > 0 {
                        info!(stream = %self.stream_id, attempts = attempt + 1, "Poll recovered");
                    }
                    self.health.mark_healthy(&component);
                    self.metrics.record_polled(poll.records.len() as u64);
                    return Ok(Some(poll));
                }
                Err(e) if e.is_transient() => {
                    self.metrics.record_poll_error();
                    self.health
                        .mark_degraded(&component, &format!("Poll failed: {}", e));
                    let delay = retry.calculate_delay(attempt.min(MAX_POLL_BACKOFF_EXPONENT));
                    warn!(
                        stream = %self.stream_id,
                        offset = %since,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Poll failed, retrying"
                    );
                    attempt = attempt.saturating_add(1);
                    if self.wait_or_stop(delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    self.health
                        .mark_unhealthy(&component, &format!("Poll failed: {}", e));
                    return Err(e.into());
                }
            }
        }
    }

    fn decode(&self, batch_id: u64, start: Offset, end: Offset, raws: &[RawRecord]) -> Batch {
        self.set_state(StreamState::Decoding);
        let output = self.decoder.decode_all(raws);
        self.metrics
            .record_decoded(output.records.len() as u64, output.failures as u64);
        if output.failures > 0 {
            warn!(
                stream = %self.stream_id,
                batch_id,
                failures = output.failures,
                "Batch contains malformed records"
            );
        }

        Batch {
            id: batch_id,
            start,
            end,
            records: output.records.into(),
            decode_failures: output.failures,
        }
    }

    async fn plan(&self, batch: &Batch) -> Result<()> {
        self.append_checkpoint(CheckpointEntry::BatchPlanned {
            batch_id: batch.id,
            start: batch.start,
            end: batch.end,
            record_count: batch.len() as u64,
            timestamp: Utc::now(),
        })
        .await
    }

    /// Sink and commit one batch. Stop requests are not observed here, so an
    /// in-flight batch always runs to its commit or to failure.
    async fn execute(
        &mut self,
        batch: Batch,
        already_published: &BTreeMap<String, Vec<PublishedFile>>,
        started: Instant,
    ) -> Result<()> {
        self.set_state(StreamState::Sinking);

        let mut committed: BTreeMap<String, bool> = BTreeMap::new();
        let mut rows: BTreeMap<String, u64> = BTreeMap::new();
        let mut pending: Vec<Arc<dyn Sink>> = Vec::new();
        for sink in &self.sinks {
            if sink.is_durable() && already_published.contains_key(sink.id()) {
                debug!(
                    stream = %self.stream_id,
                    batch_id = batch.id,
                    sink = %sink.id(),
                    "Sink already published batch, skipping"
                );
                committed.insert(sink.id().to_string(), true);
            } else {
                pending.push(sink.clone());
            }
        }

        let retry = self.config.retry_config(self.config.max_sink_retries);
        let mut attempt = 0u32;
        loop {
            let mut failed: Vec<Arc<dyn Sink>> = Vec::new();
            let mut last_error: Option<SinkError> = None;

            for sink in pending {
                let component = self.component(&format!("sink:{}", sink.id()));
                match sink.write(&batch).await {
                    Ok(receipt) => {
                        self.health.mark_healthy(&component);
                        self.metrics.record_sink_write(
                            sink.id(),
                            receipt.rows,
                            receipt.files.len() as u64,
                            receipt.bytes_written(),
                        );
                        debug!(
                            stream = %self.stream_id,
                            batch_id = batch.id,
                            sink = %sink.id(),
                            rows = receipt.rows,
                            files = receipt.files.len(),
                            "Sink accepted batch"
                        );
                        if sink.is_durable() {
                            self.append_checkpoint(CheckpointEntry::SinkCommitted {
                                batch_id: batch.id,
                                sink_id: sink.id().to_string(),
                                files: receipt.files,
                                timestamp: Utc::now(),
                            })
                            .await?;
                        }
                        rows.insert(sink.id().to_string(), receipt.rows);
                        committed.insert(sink.id().to_string(), true);
                    }
                    Err(e) => {
                        self.metrics.record_sink_failure();
                        if !e.is_retryable() {
                            self.health.mark_unhealthy(&component, &e.to_string());
                            self.discard(batch.id, std::slice::from_ref(&sink)).await;
                            return Err(e.into());
                        }
                        self.health.mark_degraded(&component, &e.to_string());
                        warn!(
                            stream = %self.stream_id,
                            batch_id = batch.id,
                            sink = %sink.id(),
                            attempt = attempt + 1,
                            error = %e,
                            "Sink write failed"
                        );
                        failed.push(sink);
                        last_error = Some(e);
                    }
                }
            }

            let Some(err) = last_error else {
                break;
            };
            self.discard(batch.id, &failed).await;
            if !retry.should_retry(attempt) {
                for sink in &failed {
                    let component = self.component(&format!("sink:{}", sink.id()));
                    self.health.mark_unhealthy(&component, &err.to_string());
                }
                return Err(err.into());
            }

            tokio::time::sleep(retry.calculate_delay(attempt)).await;
            attempt += 1;
            self.metrics.record_sink_retry();
            pending = failed;
        }

        self.commit(batch, committed, rows, started).await
    }

    /// Abort the batch on each failed sink so nothing of it stays published.
    async fn discard(&self, batch_id: u64, sinks: &[Arc<dyn Sink>]) {
        for sink in sinks {
            if let Err(e) = sink.abort(batch_id).await {
                warn!(
                    stream = %self.stream_id,
                    batch_id = batch_id,
                    sink = %sink.id(),
                    error = %e,
                    "Failed to discard partial sink output"
                );
            }
        }
    }

    async fn commit(
        &mut self,
        batch: Batch,
        sinks: BTreeMap<String, bool>,
        rows: BTreeMap<String, u64>,
        started: Instant,
    ) -> Result<()> {
        self.set_state(StreamState::Committing);

        let duration = started.elapsed();
        self.append_checkpoint(CheckpointEntry::BatchCommitted {
            batch_id: batch.id,
            end_offset: batch.end,
            sinks,
            record_count: batch.len() as u64,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        })
        .await?;

        self.next_offset = batch.end;
        self.next_batch_id = batch.id + 1;
        self.metrics.record_commit(batch.end.0, duration);
        if let Some(view) = &self.view {
            self.metrics.set_view_rows(view.row_count() as u64);
        }
        self.progress_tx.send_modify(|p| {
            p.batch_id = Some(batch.id);
            p.committed_offset = batch.end;
            p.batches_committed += 1;
            p.last_batch_records = batch.len();
            p.last_batch_decode_failures = batch.decode_failures;
            p.last_batch_rows = rows;
            p.last_batch_duration_ms = duration.as_millis() as u64;
            p.last_committed_at = Some(Utc::now());
        });

        info!(
            stream = %self.stream_id,
            batch_id = batch.id,
            rows = batch.len(),
            offset_range = %format!("{}..{}", batch.start, batch.end),
            decode_failures = batch.decode_failures,
            duration_ms = duration.as_millis() as u64,
            "Batch committed"
        );

        self.set_state(StreamState::Idle);
        Ok(())
    }

    /// Append to the checkpoint log, retrying write failures with backoff.
    async fn append_checkpoint(&self, entry: CheckpointEntry) -> Result<()> {
        let component = self.component("checkpoint");
        let retry = self.config.retry_config(self.config.max_commit_retries);
        let mut attempt = 0u32;

        loop {
            match self.checkpoint.append(entry.clone()) {
                Ok(()) => {
                    if attempt > 0 {
                        self.health.mark_healthy(&component);
                    }
                    return Ok(());
                }
                Err(e @ Error::Checkpoint(CheckpointError::NonMonotonic { .. })) => {
                    self.health.mark_unhealthy(&component, &e.to_string());
                    return Err(e);
                }
                Err(e) if retry.should_retry(attempt) => {
                    self.metrics.record_commit_retry();
                    self.health.mark_degraded(&component, &e.to_string());
                    let delay = retry.calculate_delay(attempt);
                    warn!(
                        stream = %self.stream_id,
                        entry = entry.type_name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.health.mark_unhealthy(&component, &e.to_string());
                    return Err(e);
                }
            }
        }
    }

    async fn update_lag(&self) {
        match self.source.latest_offset().await {
            Ok(Some(latest)) => self
                .metrics
                .set_source_lag(latest.0.saturating_sub(self.next_offset.0)),
            Ok(None) => {}
            Err(e) => debug!(stream = %self.stream_id, error = %e, "Could not read latest offset"),
        }
    }

    fn set_state(&self, state: StreamState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            debug!(stream = %self.stream_id, from = %previous, to = %state, "State changed");
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep for `delay` unless a stop is requested first. Returns whether
    /// a stop was requested.
    async fn wait_or_stop(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.stop_requested(),
            _ = stop_signal(self.stop.subscribe()) => true,
        }
    }

    fn component(&self, name: &str) -> String {
        component_name(&self.stream_id, name)
    }
}

/// Resolves once the stop flag is set.
async fn stop_signal(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
