//! Assembling a stream from configuration and injected parts.

use super::handle::{HandleParts, StreamHandle};
use super::scheduler::Scheduler;
use super::state::{StreamProgress, StreamState};
use crate::checkpoint::{CheckpointLog, CheckpointStore};
use crate::config::{CheckpointConfig, Config, SchedulerConfig, SourceConfig, StreamConfig};
use crate::decoder::RecordDecoder;
use crate::error::{Error, Result};
use crate::health::{component_name, HealthCheck};
use crate::metrics::StreamMetrics;
use crate::query::ViewCatalog;
use crate::record::Offset;
use crate::sink::{MaterializedView, PartitionedFileSink, Sink};
use crate::source::{DirectorySource, MemorySource, Source};
use object_store::ObjectStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Builder for a single stream.
///
/// Everything not injected is built from the [`StreamConfig`]: the source
/// from `source`, the view and file sinks from `sinks`, and a
/// [`CheckpointLog`] under the checkpoint dir.
pub struct StreamBuilder {
    stream: StreamConfig,
    scheduler: SchedulerConfig,
    checkpoint_config: CheckpointConfig,
    source: Option<Arc<dyn Source>>,
    extra_sinks: Vec<Arc<dyn Sink>>,
    checkpoint: Option<Arc<dyn CheckpointStore>>,
    file_store: Option<(Arc<dyn ObjectStore>, String)>,
    health: Option<Arc<HealthCheck>>,
    catalog: Option<ViewCatalog>,
}

impl StreamBuilder {
    /// Start from a stream definition with default scheduler and checkpoint settings.
    pub fn new(stream: StreamConfig) -> Self {
        let scheduler = stream.effective_scheduler(&SchedulerConfig::default());
        Self {
            stream,
            scheduler,
            checkpoint_config: CheckpointConfig::default(),
            source: None,
            extra_sinks: Vec::new(),
            checkpoint: None,
            file_store: None,
            health: None,
            catalog: None,
        }
    }

    /// Start from one stream of a loaded configuration.
    pub fn from_config(config: &Config, stream_id: &str) -> Result<Self> {
        let stream = config
            .stream(stream_id)
            .ok_or_else(|| Error::Config(format!("Unknown stream: {}", stream_id)))?
            .clone();
        let scheduler = stream.effective_scheduler(&config.scheduler);
        Ok(Self::new(stream)
            .with_scheduler_config(scheduler)
            .with_checkpoint_config(config.checkpoint.clone()))
    }

    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_checkpoint_config(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint_config = checkpoint;
        self
    }

    /// Use this source instead of the configured one.
    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    /// Feed batches to an additional sink after the configured ones.
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    /// Use this checkpoint store instead of a log under the checkpoint dir.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Write the file sink's output to this store instead of the configured root.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        self.file_store = Some((store, prefix.into()));
        self
    }

    /// Report component health to a shared tracker.
    pub fn with_health(mut self, health: Arc<HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    /// Register the stream's view in a catalog when it starts.
    pub fn with_catalog(mut self, catalog: ViewCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Build every component and spawn the scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<StreamHandle> {
        let stream = self.stream;
        stream.validate()?;
        let schema = stream.build_schema()?;
        let spec = stream.build_partition_spec(&schema)?;

        let (source, memory_source): (Arc<dyn Source>, Option<MemorySource>) =
            match (self.source, &stream.source) {
                (Some(source), _) => (source, None),
                (None, SourceConfig::Directory { path, extensions }) => (
                    Arc::new(DirectorySource::new(path.clone(), extensions.clone())),
                    None,
                ),
                (None, SourceConfig::Memory) => {
                    let memory = MemorySource::new(stream.id.clone());
                    (Arc::new(memory.clone()), Some(memory))
                }
            };

        let view = stream.sinks.view.as_ref().map(|config| {
            let name = stream.view_name().unwrap_or(&stream.id).to_string();
            Arc::new(MaterializedView::new(name, schema.clone()).with_max_rows(config.max_rows))
        });

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        if let Some(view) = &view {
            sinks.push(view.clone());
        }
        if let Some(files) = &stream.sinks.files {
            let sink = match self.file_store {
                Some((store, prefix)) => {
                    PartitionedFileSink::with_store(store, prefix, schema.clone(), spec, files.format)
                        .with_compression(files.compression)
                }
                None => PartitionedFileSink::new(files, schema.clone(), spec)?,
            };
            sinks.push(Arc::new(sink));
        }
        sinks.extend(self.extra_sinks);

        let mut ids = HashSet::new();
        for sink in &sinks {
            if !ids.insert(sink.id().to_string()) {
                return Err(Error::Config(format!(
                    "Stream {} has two sinks with id {}",
                    stream.id,
                    sink.id()
                )));
            }
        }

        let checkpoint: Arc<dyn CheckpointStore> = match self.checkpoint {
            Some(store) => store,
            None => Arc::new(CheckpointLog::open_for_stream(
                &stream.id,
                &self.checkpoint_config,
            )?),
        };

        if let (Some(catalog), Some(view)) = (&self.catalog, &view) {
            catalog.register(view.clone())?;
        }

        let health = self.health.unwrap_or_default();
        health.register_component(&component_name(&stream.id, "source"));
        health.register_component(&component_name(&stream.id, "checkpoint"));
        for sink in &sinks {
            health.register_component(&component_name(&stream.id, &format!("sink:{}", sink.id())));
        }

        let metrics = Arc::new(StreamMetrics::new());
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let (progress_tx, progress_rx) = watch::channel(StreamProgress {
            stream_id: stream.id.clone(),
            ..StreamProgress::default()
        });
        let (stop_tx, _) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        info!(
            stream = %stream.id,
            source = %source.name(),
            sinks = ?sinks.iter().map(|s| s.id().to_string()).collect::<Vec<_>>(),
            max_records_per_batch = self.scheduler.max_records_per_batch,
            "Starting stream"
        );

        let scheduler = Scheduler {
            stream_id: stream.id.clone(),
            source: source.clone(),
            decoder: RecordDecoder::new(schema),
            sinks,
            checkpoint,
            config: self.scheduler,
            metrics: metrics.clone(),
            health: health.clone(),
            view: view.clone(),
            state_tx,
            progress_tx,
            stop: stop_tx.clone(),
            next_offset: Offset::ZERO,
            next_batch_id: 0,
        };
        let task = tokio::spawn(scheduler.run());

        Ok(StreamHandle::new(HandleParts {
            id: stream.id,
            state_rx,
            progress_rx,
            stop_tx,
            task,
            source,
            memory_source,
            view,
            metrics,
            health,
        }))
    }
}

/// Start one configured stream, registering its view in `catalog`.
pub fn start_stream(config: &Config, stream_id: &str, catalog: &ViewCatalog) -> Result<StreamHandle> {
    StreamBuilder::from_config(config, stream_id)?
        .with_catalog(catalog.clone())
        .start()
}

/// Start every configured stream with a shared health tracker.
///
/// If one stream fails to start, the ones already started are asked to stop
/// and the error is returned.
pub fn start_all(
    config: &Config,
    catalog: &ViewCatalog,
    health: Arc<HealthCheck>,
) -> Result<Vec<StreamHandle>> {
    let mut handles = Vec::with_capacity(config.streams.len());
    for stream in &config.streams {
        let started = StreamBuilder::from_config(config, &stream.id).and_then(|builder| {
            builder
                .with_catalog(catalog.clone())
                .with_health(health.clone())
                .start()
        });
        match started {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for handle in &handles {
                    handle.request_stop();
                }
                return Err(e);
            }
        }
    }
    Ok(handles)
}
