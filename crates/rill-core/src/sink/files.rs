//! Partitioned file sink.
//!
//! A batch is written in two steps:
//! 1. Every partition's records are encoded and uploaded under
//!    `_staging/batch-<id>/`
//! 2. Each staged file is renamed to
//!    `<field>=<value>/.../part-<batch>-<n>.<ext>`
//!
//! Final names depend only on the batch id and the partition order, so
//! re-running a batch after a crash overwrites its earlier output instead
//! of adding a second copy.

use super::columnar::to_record_batch;
use super::{Sink, SinkReceipt};
use crate::checkpoint::PublishedFile;
use crate::config::{FileFormat, FileSinkConfig, ParquetCompression};
use crate::error::{Error, Result, SinkError};
use crate::partition::{PartitionKey, PartitionSpec};
use crate::record::{Batch, DecodedRecord};
use crate::schema::Schema;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STAGING_DIR: &str = "_staging";

/// Create an object store for a sink root: `s3://bucket/prefix` or a local
/// directory. Returns the store and the key prefix inside it.
pub fn create_object_store(config: &FileSinkConfig) -> Result<(Arc<dyn ObjectStore>, String)> {
    if config.root.starts_with("s3://") {
        create_s3_store(config)
    } else {
        create_local_store(config)
    }
}

fn create_s3_store(config: &FileSinkConfig) -> Result<(Arc<dyn ObjectStore>, String)> {
    use object_store::aws::AmazonS3Builder;

    let rest = config.root.trim_start_matches("s3://");
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(Error::Config(format!("Invalid S3 root: {}", config.root)));
    }

    let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);

    if let Some(ref region) = config.aws_region {
        builder = builder.with_region(region);
    }

    if let Some(ref access_key) = config.aws_access_key_id {
        builder = builder.with_access_key_id(access_key);
    }

    if let Some(ref secret_key) = config.aws_secret_access_key {
        builder = builder.with_secret_access_key(secret_key);
    }

    if let Some(ref endpoint) = config.s3_endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }

    let store = builder.build()?;

    Ok((Arc::new(store), prefix.trim_matches('/').to_string()))
}

fn create_local_store(config: &FileSinkConfig) -> Result<(Arc<dyn ObjectStore>, String)> {
    use object_store::local::LocalFileSystem;

    let path = std::path::Path::new(&config.root);

    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| {
            Error::Config(format!(
                "Failed to create output directory {}: {}",
                path.display(),
                e
            ))
        })?;
    }

    let store = LocalFileSystem::new_with_prefix(path).map_err(|e| {
        Error::Config(format!(
            "Failed to create local file system store for {}: {}",
            path.display(),
            e
        ))
    })?;

    Ok((Arc::new(store), String::new()))
}

/// A file uploaded to staging, waiting to be published.
struct StagedFile {
    staged: ObjectPath,
    target: ObjectPath,
    relative: String,
    size_bytes: u64,
    row_count: u64,
    checksum: u32,
}

/// Durable sink writing one directory per partition key.
pub struct PartitionedFileSink {
    id: String,
    root: String,
    store: Arc<dyn ObjectStore>,
    prefix: String,
    schema: Arc<Schema>,
    spec: PartitionSpec,
    format: FileFormat,
    compression: ParquetCompression,
    /// Files published per batch, for abort
    published: Mutex<HashMap<u64, Vec<ObjectPath>>>,
}

impl PartitionedFileSink {
    /// Build a sink from configuration.
    pub fn new(config: &FileSinkConfig, schema: Arc<Schema>, spec: PartitionSpec) -> Result<Self> {
        let (store, prefix) = create_object_store(config)?;
        info!(
            root = %config.root,
            format = ?config.format,
            partitioned_by = ?spec.rules().iter().map(|r| r.key_name()).collect::<Vec<_>>(),
            "File sink ready"
        );
        Ok(Self {
            id: "files".to_string(),
            root: config.root.clone(),
            store,
            prefix,
            schema,
            spec,
            format: config.format,
            compression: config.compression,
            published: Mutex::new(HashMap::new()),
        })
    }

    /// Build a sink over an existing object store.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        schema: Arc<Schema>,
        spec: PartitionSpec,
        format: FileFormat,
    ) -> Self {
        let prefix = prefix.into();
        Self {
            id: "files".to_string(),
            root: prefix.clone(),
            store,
            prefix,
            schema,
            spec,
            format,
            compression: ParquetCompression::default(),
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Use a different sink id, e.g. when a stream has several file sinks.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_compression(mut self, compression: ParquetCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn spec(&self) -> &PartitionSpec {
        &self.spec
    }

    /// Group records by partition key. Records without a key are dropped.
    fn group<'a>(&self, batch: &'a Batch) -> (BTreeMap<PartitionKey, Vec<&'a DecodedRecord>>, usize) {
        let mut groups: BTreeMap<PartitionKey, Vec<&DecodedRecord>> = BTreeMap::new();
        let mut skipped = 0;
        for record in batch.records.iter() {
            match self.spec.extract_key(record) {
                Some(key) => groups.entry(key).or_default().push(record),
                None => skipped += 1,
            }
        }
        (groups, skipped)
    }

    fn object_path(&self, relative: &str) -> std::result::Result<ObjectPath, SinkError> {
        let full = if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        };
        ObjectPath::parse(&full).map_err(|e| self.write_error(format!("invalid path {}: {}", full, e)))
    }

    fn staging_dir(&self, batch_id: u64) -> String {
        format!("{}/batch-{:020}", STAGING_DIR, batch_id)
    }

    fn file_name(&self, batch_id: u64, n: usize) -> String {
        format!("part-{:020}-{:05}.{}", batch_id, n, self.format.extension())
    }

    fn encode(&self, records: &[&DecodedRecord]) -> std::result::Result<Bytes, SinkError> {
        match self.format {
            FileFormat::Json => {
                let mut buffer = Vec::new();
                for record in records {
                    serde_json::to_writer(&mut buffer, &record.to_json())
                        .map_err(|e| self.write_error(format!("JSON encoding failed: {}", e)))?;
                    buffer.push(b'\n');
                }
                Ok(Bytes::from(buffer))
            }
            FileFormat::Parquet => self.convert_to_parquet(records),
        }
    }

    fn convert_to_parquet(&self, records: &[&DecodedRecord]) -> std::result::Result<Bytes, SinkError> {
        let batch = to_record_batch(&self.schema, records)
            .map_err(|e| self.write_error(format!("Failed to build record batch: {}", e)))?;

        let mut buffer = Cursor::new(Vec::new());

        let compression = match self.compression {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(Default::default()),
            ParquetCompression::Lz4 => Compression::LZ4,
            ParquetCompression::Zstd => Compression::ZSTD(Default::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        };

        let props = WriterProperties::builder()
            .set_compression(compression)
            .set_max_row_group_size(128 * 1024)
            .set_write_batch_size(1024)
            .build();

        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
            .map_err(|e| self.write_error(format!("Failed to create Parquet writer: {}", e)))?;

        writer
            .write(&batch)
            .map_err(|e| self.write_error(format!("Failed to write Parquet: {}", e)))?;

        writer
            .close()
            .map_err(|e| self.write_error(format!("Failed to close Parquet writer: {}", e)))?;

        Ok(Bytes::from(buffer.into_inner()))
    }

    async fn stage(&self, batch: &Batch) -> std::result::Result<Vec<StagedFile>, SinkError> {
        let (groups, skipped) = self.group(batch);
        if skipped > 0 {
            debug!(
                sink = %self.id,
                batch_id = batch.id,
                skipped,
                "Records without a partition key left out of file output"
            );
        }

        let staging_dir = self.staging_dir(batch.id);
        let mut staged = Vec::with_capacity(groups.len());

        for (n, (key, records)) in groups.iter().enumerate() {
            let file_name = self.file_name(batch.id, n);
            let partition_path = key.path();
            let relative = if partition_path.is_empty() {
                file_name
            } else {
                format!("{}/{}", partition_path, file_name)
            };

            let data = self.encode(records)?;
            let size_bytes = data.len() as u64;
            let checksum = crc32fast::hash(&data);

            let staged_path = self.object_path(&format!("{}/{}", staging_dir, relative))?;
            self.store
                .put(&staged_path, PutPayload::from_bytes(data))
                .await
                .map_err(|e| self.write_error(format!("Failed to upload {}: {}", staged_path, e)))?;

            debug!(sink = %self.id, path = %staged_path, size_bytes, "Staged file");

            staged.push(StagedFile {
                staged: staged_path,
                target: self.object_path(&relative)?,
                relative,
                size_bytes,
                row_count: records.len() as u64,
                checksum,
            });
        }

        Ok(staged)
    }

    async fn publish(
        &self,
        batch_id: u64,
        staged: Vec<StagedFile>,
    ) -> std::result::Result<Vec<PublishedFile>, SinkError> {
        let mut files = Vec::with_capacity(staged.len());

        for file in staged {
            self.store
                .rename(&file.staged, &file.target)
                .await
                .map_err(|e| SinkError::Publish {
                    sink: self.id.clone(),
                    message: format!("Failed to publish {}: {}", file.target, e),
                })?;

            self.published
                .lock()
                .entry(batch_id)
                .or_default()
                .push(file.target.clone());

            debug!(sink = %self.id, path = %file.target, "Published file");

            files.push(PublishedFile {
                path: file.relative,
                size_bytes: file.size_bytes,
                row_count: file.row_count,
                checksum: format!("{:08x}", file.checksum),
            });
        }

        Ok(files)
    }

    async fn delete_prefix(&self, relative: &str) -> std::result::Result<usize, SinkError> {
        let prefix = self.object_path(relative)?;
        let objects: Vec<_> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| self.write_error(format!("Failed to list {}: {}", prefix, e)))?;

        for meta in &objects {
            self.delete_quietly(&meta.location).await;
        }
        Ok(objects.len())
    }

    async fn delete_quietly(&self, path: &ObjectPath) {
        match self.store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => warn!(sink = %self.id, path = %path, error = %e, "Failed to delete file"),
        }
    }

    fn write_error(&self, message: String) -> SinkError {
        SinkError::Write {
            sink: self.id.clone(),
            message,
        }
    }
}

#[async_trait]
impl Sink for PartitionedFileSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn write(&self, batch: &Batch) -> std::result::Result<SinkReceipt, SinkError> {
        let staged = self.stage(batch).await?;
        let files = self.publish(batch.id, staged).await?;
        let rows = files.iter().map(|f| f.row_count).sum();

        // The batch is fully published; nothing left to abort.
        self.published.lock().remove(&batch.id);

        debug!(
            sink = %self.id,
            batch_id = batch.id,
            files = files.len(),
            rows,
            "Batch written"
        );

        Ok(SinkReceipt { rows, files })
    }

    async fn abort(&self, batch_id: u64) -> std::result::Result<(), SinkError> {
        let published = self.published.lock().remove(&batch_id).unwrap_or_default();
        for path in &published {
            self.delete_quietly(path).await;
        }
        let staged = self.delete_prefix(&self.staging_dir(batch_id)).await?;

        if !published.is_empty() || staged > 0 {
            warn!(
                sink = %self.id,
                batch_id,
                published_removed = published.len(),
                staged_removed = staged,
                "Aborted partial batch output"
            );
        }
        Ok(())
    }
}
