//! Stream metrics and their Prometheus text export.

mod prometheus;

pub use prometheus::{export_prometheus_text, BatchDurationHistogram, MetricsSnapshot, StreamMetrics};
