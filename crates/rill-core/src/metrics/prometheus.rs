//! Prometheus metrics export.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for batch duration.
/// Converts to seconds: [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
const BATCH_DURATION_BUCKETS_MS: [u64; 7] = [100, 250, 500, 1000, 2500, 5000, 10000];

/// Per-stream metrics with counters, gauges, and a batch duration histogram.
pub struct StreamMetrics {
    // === COUNTERS ===
    /// Raw records returned by the source
    records_polled: AtomicU64,

    /// Records decoded into batches (malformed ones included)
    records_decoded: AtomicU64,

    /// Records whose payload could not be parsed
    decode_failures: AtomicU64,

    /// Polls that failed with a source error
    poll_errors: AtomicU64,

    /// Batches committed to the checkpoint log
    batches_committed: AtomicU64,

    /// Sink write attempts that failed
    sink_failures: AtomicU64,

    /// Batches re-sent to a sink after a failure
    sink_retries: AtomicU64,

    /// Checkpoint writes retried
    commit_retries: AtomicU64,

    /// Files made visible by durable sinks
    files_published: AtomicU64,

    /// Bytes written by durable sinks
    bytes_written: AtomicU64,

    /// Rows accepted, by sink id
    rows_written: Mutex<BTreeMap<String, u64>>,

    // === GAUGES ===
    /// Offset below which everything is committed
    committed_offset: AtomicU64,

    /// Records available in the source beyond the committed offset
    source_lag: AtomicU64,

    /// Rows currently held by the stream's view
    view_rows: AtomicU64,

    // === HISTOGRAM: batch_duration_seconds ===
    /// Sum of all batch durations in milliseconds
    batch_duration_sum_ms: AtomicU64,

    /// Count of batch duration observations
    batch_duration_count: AtomicU64,

    /// Buckets: [0.1s, 0.25s, 0.5s, 1.0s, 2.5s, 5.0s, 10.0s, +Inf]
    batch_duration_buckets: [AtomicU64; 8],
}

impl StreamMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            records_polled: AtomicU64::new(0),
            records_decoded: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            batches_committed: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            sink_retries: AtomicU64::new(0),
            commit_retries: AtomicU64::new(0),
            files_published: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            rows_written: Mutex::new(BTreeMap::new()),
            committed_offset: AtomicU64::new(0),
            source_lag: AtomicU64::new(0),
            view_rows: AtomicU64::new(0),
            batch_duration_sum_ms: AtomicU64::new(0),
            batch_duration_count: AtomicU64::new(0),
            batch_duration_buckets: Default::default(),
        }
    }

    // === COUNTER RECORDING ===

    pub fn record_polled(&self, count: u64) {
        self.records_polled.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a decoded batch and how many of its records were malformed.
    pub fn record_decoded(&self, count: u64, failures: u64) {
        self.records_decoded.fetch_add(count, Ordering::Relaxed);
        self.decode_failures.fetch_add(failures, Ordering::Relaxed);
    }

    pub fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_retry(&self) {
        self.sink_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_retry(&self) {
        self.commit_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sink's accepted output for one batch.
    pub fn record_sink_write(&self, sink_id: &str, rows: u64, files: u64, bytes: u64) {
        *self
            .rows_written
            .lock()
            .entry(sink_id.to_string())
            .or_insert(0) += rows;
        self.files_published.fetch_add(files, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a committed batch with duration histogram.
    pub fn record_commit(&self, end_offset: u64, duration: Duration) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.committed_offset.store(end_offset, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.batch_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.batch_duration_count.fetch_add(1, Ordering::Relaxed);

        // Buckets are cumulative (le = less than or equal)
        for (i, &bucket_ms) in BATCH_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.batch_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.batch_duration_buckets[7].fetch_add(1, Ordering::Relaxed);
    }

    // === GAUGE UPDATES ===

    /// Set the committed offset without counting a batch, e.g. after recovery.
    pub fn set_committed_offset(&self, offset: u64) {
        self.committed_offset.store(offset, Ordering::Relaxed);
    }

    pub fn set_source_lag(&self, lag: u64) {
        self.source_lag.store(lag, Ordering::Relaxed);
    }

    pub fn set_view_rows(&self, rows: u64) {
        self.view_rows.store(rows, Ordering::Relaxed);
    }

    // === GETTERS ===

    pub fn records_polled(&self) -> u64 {
        self.records_polled.load(Ordering::Relaxed)
    }

    pub fn records_decoded(&self) -> u64 {
        self.records_decoded.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn poll_errors(&self) -> u64 {
        self.poll_errors.load(Ordering::Relaxed)
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.load(Ordering::Relaxed)
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    pub fn sink_retries(&self) -> u64 {
        self.sink_retries.load(Ordering::Relaxed)
    }

    pub fn commit_retries(&self) -> u64 {
        self.commit_retries.load(Ordering::Relaxed)
    }

    pub fn files_published(&self) -> u64 {
        self.files_published.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Rows accepted by one sink.
    pub fn rows_written(&self, sink_id: &str) -> u64 {
        self.rows_written.lock().get(sink_id).copied().unwrap_or(0)
    }

    pub fn committed_offset(&self) -> u64 {
        self.committed_offset.load(Ordering::Relaxed)
    }

    pub fn source_lag(&self) -> u64 {
        self.source_lag.load(Ordering::Relaxed)
    }

    pub fn view_rows(&self) -> u64 {
        self.view_rows.load(Ordering::Relaxed)
    }

    /// Get batch duration histogram data for Prometheus export.
    pub fn batch_duration_histogram(&self) -> BatchDurationHistogram {
        let mut buckets = [(0.0, 0); 7];
        for (i, &bucket_ms) in BATCH_DURATION_BUCKETS_MS.iter().enumerate() {
            buckets[i] = (
                bucket_ms as f64 / 1000.0,
                self.batch_duration_buckets[i].load(Ordering::Relaxed),
            );
        }
        BatchDurationHistogram {
            sum_seconds: self.batch_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.batch_duration_count.load(Ordering::Relaxed),
            buckets,
            inf_bucket: self.batch_duration_buckets[7].load(Ordering::Relaxed),
        }
    }

    /// Point-in-time copy for status reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_polled: self.records_polled(),
            records_decoded: self.records_decoded(),
            decode_failures: self.decode_failures(),
            poll_errors: self.poll_errors(),
            batches_committed: self.batches_committed(),
            sink_failures: self.sink_failures(),
            sink_retries: self.sink_retries(),
            commit_retries: self.commit_retries(),
            files_published: self.files_published(),
            bytes_written: self.bytes_written(),
            rows_written: self.rows_written.lock().clone(),
            committed_offset: self.committed_offset(),
            source_lag: self.source_lag(),
            view_rows: self.view_rows(),
        }
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch duration histogram data.
#[derive(Debug, Clone)]
pub struct BatchDurationHistogram {
    /// Sum of all observations in seconds
    pub sum_seconds: f64,
    /// Total count of observations
    pub count: u64,
    /// Bucket boundaries (le) and cumulative counts
    pub buckets: [(f64, u64); 7],
    /// +Inf bucket count (equals total count)
    pub inf_bucket: u64,
}

/// Serializable copy of a stream's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_polled: u64,
    pub records_decoded: u64,
    pub decode_failures: u64,
    pub poll_errors: u64,
    pub batches_committed: u64,
    pub sink_failures: u64,
    pub sink_retries: u64,
    pub commit_retries: u64,
    pub files_published: u64,
    pub bytes_written: u64,
    pub rows_written: BTreeMap<String, u64>,
    pub committed_offset: u64,
    pub source_lag: u64,
    pub view_rows: u64,
}

type Getter = fn(&StreamMetrics) -> u64;

const COUNTERS: [(&str, &str, Getter); 10] = [
    (
        "records_polled_total",
        "Raw records returned by the source",
        StreamMetrics::records_polled,
    ),
    (
        "records_decoded_total",
        "Records decoded into batches",
        StreamMetrics::records_decoded,
    ),
    (
        "decode_failures_total",
        "Records whose payload could not be parsed",
        StreamMetrics::decode_failures,
    ),
    (
        "poll_errors_total",
        "Polls that failed with a source error",
        StreamMetrics::poll_errors,
    ),
    (
        "batches_committed_total",
        "Batches committed to the checkpoint log",
        StreamMetrics::batches_committed,
    ),
    (
        "sink_failures_total",
        "Sink write attempts that failed",
        StreamMetrics::sink_failures,
    ),
    (
        "sink_retries_total",
        "Batches re-sent to a sink after a failure",
        StreamMetrics::sink_retries,
    ),
    (
        "commit_retries_total",
        "Checkpoint writes retried",
        StreamMetrics::commit_retries,
    ),
    (
        "files_published_total",
        "Files made visible by durable sinks",
        StreamMetrics::files_published,
    ),
    (
        "bytes_written_total",
        "Bytes written by durable sinks",
        StreamMetrics::bytes_written,
    ),
];

const GAUGES: [(&str, &str, Getter); 3] = [
    (
        "committed_offset",
        "Offset below which all records are committed",
        StreamMetrics::committed_offset,
    ),
    (
        "source_lag",
        "Records available in the source beyond the committed offset",
        StreamMetrics::source_lag,
    ),
    (
        "view_rows",
        "Rows held by the stream's materialized view",
        StreamMetrics::view_rows,
    ),
];

/// Export metrics for a set of streams in Prometheus text format.
///
/// Every sample carries a `stream` label.
///
/// # Example
/// ```
/// use rill_core::metrics::{export_prometheus_text, StreamMetrics};
///
/// let metrics = StreamMetrics::new();
/// metrics.record_polled(3);
/// let text = export_prometheus_text("rill", &[("weather", &metrics)]);
/// assert!(text.contains("rill_records_polled_total{stream=\"weather\"} 3"));
/// ```
pub fn export_prometheus_text(prefix: &str, streams: &[(&str, &StreamMetrics)]) -> String {
    let mut output = String::with_capacity(4096);

    // === COUNTERS ===

    for (name, help, get) in COUNTERS {
        output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
        output.push_str(&format!("# TYPE {}_{} counter\n", prefix, name));
        for &(stream, metrics) in streams {
            output.push_str(&format!(
                "{}_{}{{stream=\"{}\"}} {}\n",
                prefix,
                name,
                stream,
                get(metrics)
            ));
        }
        output.push('\n');
    }

    output.push_str(&format!(
        "# HELP {}_rows_written_total Rows accepted by each sink\n",
        prefix
    ));
    output.push_str(&format!("# TYPE {}_rows_written_total counter\n", prefix));
    for &(stream, metrics) in streams {
        for (sink, rows) in metrics.rows_written.lock().iter() {
            output.push_str(&format!(
                "{}_rows_written_total{{stream=\"{}\",sink=\"{}\"}} {}\n",
                prefix, stream, sink, rows
            ));
        }
    }
    output.push('\n');

    // === GAUGES ===

    for (name, help, get) in GAUGES {
        output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
        output.push_str(&format!("# TYPE {}_{} gauge\n", prefix, name));
        for &(stream, metrics) in streams {
            output.push_str(&format!(
                "{}_{}{{stream=\"{}\"}} {}\n",
                prefix,
                name,
                stream,
                get(metrics)
            ));
        }
        output.push('\n');
    }

    // === HISTOGRAM: batch_duration_seconds ===

    output.push_str(&format!(
        "# HELP {}_batch_duration_seconds Time from poll to commit for each batch\n",
        prefix
    ));
    output.push_str(&format!(
        "# TYPE {}_batch_duration_seconds histogram\n",
        prefix
    ));
    for &(stream, metrics) in streams {
        let hist = metrics.batch_duration_histogram();
        for (le, count) in &hist.buckets {
            output.push_str(&format!(
                "{}_batch_duration_seconds_bucket{{stream=\"{}\",le=\"{}\"}} {}\n",
                prefix, stream, le, count
            ));
        }
        output.push_str(&format!(
            "{}_batch_duration_seconds_bucket{{stream=\"{}\",le=\"+Inf\"}} {}\n",
            prefix, stream, hist.inf_bucket
        ));
        output.push_str(&format!(
            "{}_batch_duration_seconds_sum{{stream=\"{}\"}} {}\n",
            prefix, stream, hist.sum_seconds
        ));
        output.push_str(&format!(
            "{}_batch_duration_seconds_count{{stream=\"{}\"}} {}\n",
            prefix, stream, hist.count
        ));
    }

    output
}
