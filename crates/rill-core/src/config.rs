//! Configuration structures for rill.
//!
//! Configuration is loaded from a TOML file holding global scheduler,
//! checkpoint and monitoring settings plus one `[[streams]]` table per
//! stream. A stream's configuration is immutable once the stream starts.

use crate::error::{Error, Result};
use crate::partition::{PartitionRule, PartitionSpec};
use crate::schema::{Field, Schema};
use crate::source::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Scheduler defaults, overridable per stream
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Checkpoint log configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Streams to run
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// A single stream: schema, partitioning, source and sinks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Stream identifier, also the checkpoint directory name
    pub id: String,

    /// Declared schema
    pub schema: Vec<Field>,

    /// Partition rules for the file sink
    #[serde(default)]
    pub partition_by: Vec<PartitionRule>,

    /// Where raw records come from
    pub source: SourceConfig,

    /// Sinks fed by this stream
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Per-stream scheduler overrides
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
}

/// Source configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Newline-delimited JSON files appearing in a directory
    Directory {
        /// Directory to watch
        path: PathBuf,

        /// File extensions to pick up
        #[serde(default = "default_extensions")]
        extensions: Vec<String>,
    },

    /// In-process source fed through the stream handle
    Memory,
}

/// Sink configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SinksConfig {
    /// Materialized view sink
    #[serde(default)]
    pub view: Option<ViewSinkConfig>,

    /// Partitioned file sink
    #[serde(default)]
    pub files: Option<FileSinkConfig>,
}

/// Materialized view configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ViewSinkConfig {
    /// Name the view is queried by, defaults to the stream id
    #[serde(default)]
    pub name: Option<String>,

    /// Optional row bound; exceeding it fails the stream
    #[serde(default)]
    pub max_rows: Option<usize>,
}

/// Partitioned file sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSinkConfig {
    /// Output root: a local path or an `s3://bucket/prefix` URI
    pub root: String,

    /// Output file format
    #[serde(default)]
    pub format: FileFormat,

    /// Parquet compression
    #[serde(default)]
    pub compression: ParquetCompression,

    /// AWS region (for S3)
    pub aws_region: Option<String>,

    /// AWS access key ID
    pub aws_access_key_id: Option<String>,

    /// AWS secret access key
    pub aws_secret_access_key: Option<String>,

    /// S3 endpoint (for MinIO or other S3-compatible storage)
    pub s3_endpoint: Option<String>,
}

impl FileSinkConfig {
    /// Local-filesystem sink writing newline-delimited JSON.
    pub fn local(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_string_lossy().into_owned(),
            format: FileFormat::default(),
            compression: ParquetCompression::default(),
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            s3_endpoint: None,
        }
    }
}

/// Output file format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Newline-delimited JSON (default)
    #[default]
    Json,
    /// Apache Parquet
    Parquet,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Json => "jsonl",
            FileFormat::Parquet => "parquet",
        }
    }
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Snappy compression (default, good balance)
    #[default]
    Snappy,
    /// Zstd compression (better ratio)
    Zstd,
    /// LZ4 compression (faster)
    Lz4,
    /// Gzip compression
    Gzip,
    /// No compression
    None,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SchedulerConfig {
    /// Wait between polls that returned nothing
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Poll timeout; a timeout is retried like any transient source error
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Upper bound on records in one batch
    #[serde(default = "default_max_records_per_batch")]
    pub max_records_per_batch: usize,

    /// Re-sink attempts for a failed batch before the stream fails
    #[serde(default = "default_max_sink_retries")]
    pub max_sink_retries: u32,

    /// Checkpoint write attempts before the stream fails
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,

    /// Base delay for exponential backoff
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff delay cap
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_records_per_batch: default_max_records_per_batch(),
            max_sink_retries: default_max_sink_retries(),
            max_commit_retries: default_max_commit_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Backoff policy shared by poll, sink and commit retries.
    pub fn retry_config(&self, max_retries: u32) -> RetryConfig {
        RetryConfig::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            max_retries,
        )
    }
}

/// Checkpoint log configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CheckpointConfig {
    /// Directory holding one subdirectory per stream
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Rotate and snapshot after this many entries
    #[serde(default = "default_compact_interval_entries")]
    pub compact_interval_entries: usize,

    /// Maximum number of log files to keep per stream
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            compact_interval_entries: default_compact_interval_entries(),
            max_log_files: default_max_log_files(),
        }
    }
}

impl CheckpointConfig {
    /// Checkpoint directory for one stream.
    pub fn stream_dir(&self, stream_id: &str) -> PathBuf {
        self.dir.join(stream_id)
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Port serving health, metrics and query endpoints
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_extensions() -> Vec<String> {
    vec!["json".into(), "jsonl".into()]
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_poll_timeout_ms() -> u64 {
    10_000
}
fn default_max_records_per_batch() -> usize {
    10_000
}
fn default_max_sink_retries() -> u32 {
    3
}
fn default_max_commit_retries() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    10_000
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}
fn default_compact_interval_entries() -> usize {
    1000
}
fn default_max_log_files() -> usize {
    4
}
fn default_http_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(Error::Config("At least one stream is required".into()));
        }

        validate_scheduler(&self.scheduler)?;

        if self.checkpoint.dir.as_os_str().is_empty() {
            return Err(Error::Config("Checkpoint dir is required".into()));
        }
        if self.checkpoint.max_log_files < 2 {
            return Err(Error::Config("checkpoint.max_log_files must be at least 2".into()));
        }

        let mut ids = HashSet::new();
        let mut views = HashSet::new();
        for stream in &self.streams {
            stream.validate()?;
            if !ids.insert(stream.id.as_str()) {
                return Err(Error::Config(format!("Duplicate stream id: {}", stream.id)));
            }
            if let Some(view) = stream.view_name() {
                if !views.insert(view.to_string()) {
                    return Err(Error::Config(format!("Duplicate view name: {}", view)));
                }
            }
        }

        Ok(())
    }

    /// Look up a stream by id.
    pub fn stream(&self, id: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.id == id)
    }
}

impl StreamConfig {
    /// Validate a single stream.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Config("Stream id is required".into()));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(format!(
                "Stream id {:?} may only contain letters, digits, '-' and '_'",
                self.id
            )));
        }

        let schema = self.build_schema()?;
        if schema.is_empty() {
            return Err(Error::Config(format!("Stream {} has an empty schema", self.id)));
        }
        self.build_partition_spec(&schema)?;

        if let SourceConfig::Directory { path, .. } = &self.source {
            if path.as_os_str().is_empty() {
                return Err(Error::Config(format!(
                    "Stream {}: source path is required",
                    self.id
                )));
            }
        }

        if self.sinks.view.is_none() && self.sinks.files.is_none() {
            return Err(Error::Config(format!(
                "Stream {} has no sinks configured",
                self.id
            )));
        }
        if let Some(files) = &self.sinks.files {
            if files.root.is_empty() {
                return Err(Error::Config(format!(
                    "Stream {}: file sink root is required",
                    self.id
                )));
            }
        } else if !self.partition_by.is_empty() {
            tracing::warn!(
                stream = %self.id,
                "Partition rules configured without a file sink, they will be ignored"
            );
        }

        if let Some(scheduler) = &self.scheduler {
            validate_scheduler(scheduler)?;
        }

        Ok(())
    }

    /// Build the declared schema.
    pub fn build_schema(&self) -> Result<Arc<Schema>> {
        Ok(Arc::new(Schema::new(self.schema.clone())?))
    }

    /// Build the partition spec against the schema.
    pub fn build_partition_spec(&self, schema: &Schema) -> Result<PartitionSpec> {
        Ok(PartitionSpec::new(self.partition_by.clone(), schema)?)
    }

    /// View name if a view sink is configured.
    pub fn view_name(&self) -> Option<&str> {
        self.sinks
            .view
            .as_ref()
            .map(|v| v.name.as_deref().unwrap_or(&self.id))
    }

    /// Scheduler settings for this stream.
    pub fn effective_scheduler(&self, defaults: &SchedulerConfig) -> SchedulerConfig {
        self.scheduler.clone().unwrap_or_else(|| defaults.clone())
    }
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<()> {
    if scheduler.max_records_per_batch == 0 {
        return Err(Error::Config(
            "max_records_per_batch must be greater than zero".into(),
        ));
    }
    if scheduler.poll_timeout_ms == 0 {
        return Err(Error::Config("poll_timeout_ms must be greater than zero".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Transform;
    use crate::schema::DataType;

    const WEATHER_TOML: &str = r#"
        [scheduler]
        poll_interval_ms = 250

        [checkpoint]
        dir = "/var/lib/rill/checkpoints"

        [[streams]]
        id = "weather"
        schema = [
            { name = "timestamp", type = "timestamp" },
            { name = "zipcode", type = "string" },
            { name = "temperature", type = "integer" },
        ]
        partition_by = [
            { source = "zipcode" },
            { name = "hour", source = "timestamp", transform = "hour" },
        ]

        [streams.source]
        kind = "directory"
        path = "/data/weather"

        [streams.sinks.view]
        name = "weather_view"

        [streams.sinks.files]
        root = "/data/out"
    "#;

    fn weather_config() -> Config {
        toml::from_str(WEATHER_TOML).unwrap()
    }

    #[test]
    fn test_parse_weather_config() {
        let config = weather_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.poll_interval_ms, 250);
        assert_eq!(config.scheduler.max_records_per_batch, 10_000);

        let stream = config.stream("weather").unwrap();
        assert_eq!(stream.schema[0].data_type, DataType::Timestamp);
        assert_eq!(stream.partition_by[1].transform, Transform::Hour);
        assert_eq!(stream.view_name(), Some("weather_view"));
        assert_eq!(
            stream.source,
            SourceConfig::Directory {
                path: PathBuf::from("/data/weather"),
                extensions: vec!["json".into(), "jsonl".into()],
            }
        );
        let files = stream.sinks.files.as_ref().unwrap();
        assert_eq!(files.format, FileFormat::Json);
        assert_eq!(files.compression, ParquetCompression::Snappy);
    }

    #[test]
    fn test_default_scheduler_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.poll_timeout_ms, 10_000);
        assert_eq!(config.max_sink_retries, 3);
        assert_eq!(config.max_commit_retries, 5);
    }

    #[test]
    fn test_default_checkpoint_config() {
        let config = CheckpointConfig::default();
        assert_eq!(config.dir, PathBuf::from("./checkpoints"));
        assert_eq!(config.compact_interval_entries, 1000);
        assert_eq!(config.max_log_files, 4);
        assert_eq!(
            config.stream_dir("weather"),
            PathBuf::from("./checkpoints/weather")
        );
    }

    #[test]
    fn test_default_monitoring_config() {
        let config = MonitoringConfig::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_validation_requires_streams() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("At least one stream"));
    }

    #[test]
    fn test_validation_duplicate_stream_ids() {
        let mut config = weather_config();
        let mut second = config.streams[0].clone();
        second.sinks.view = None;
        config.streams.push(second);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate stream id"));
    }

    #[test]
    fn test_validation_duplicate_view_names() {
        let mut config = weather_config();
        let mut second = config.streams[0].clone();
        second.id = "weather-2".into();
        config.streams.push(second);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate view name"));
    }

    #[test]
    fn test_validation_duplicate_field() {
        let mut config = weather_config();
        config.streams[0]
            .schema
            .push(Field::new("zipcode", DataType::Integer));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate field"));
    }

    #[test]
    fn test_validation_bad_partition_rule() {
        let mut config = weather_config();
        config.streams[0]
            .partition_by
            .push(PartitionRule::derived("day", "temperature", Transform::Day));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be applied"));
    }

    #[test]
    fn test_validation_requires_a_sink() {
        let mut config = weather_config();
        config.streams[0].sinks = SinksConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no sinks"));
    }

    #[test]
    fn test_validation_stream_id_charset() {
        let mut config = weather_config();
        config.streams[0].id = "../escape".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_stream_scheduler_override() {
        let mut config = weather_config();
        let defaults = config.scheduler.clone();
        assert_eq!(config.streams[0].effective_scheduler(&defaults), defaults);

        let custom = SchedulerConfig {
            max_records_per_batch: 10,
            ..SchedulerConfig::default()
        };
        config.streams[0].scheduler = Some(custom.clone());
        assert_eq!(config.streams[0].effective_scheduler(&defaults), custom);
    }

    #[test]
    fn test_memory_source_config() {
        let source: SourceConfig = toml::from_str(r#"kind = "memory""#).unwrap();
        assert_eq!(source, SourceConfig::Memory);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rill.toml");
        std::fs::write(&path, WEATHER_TOML).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.streams.len(), 1);
    }
}
