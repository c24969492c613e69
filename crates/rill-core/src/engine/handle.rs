//! Handle to a running stream.

use super::state::{StreamProgress, StreamState};
use crate::error::{Error, Result};
use crate::health::HealthCheck;
use crate::metrics::StreamMetrics;
use crate::record::Offset;
use crate::sink::MaterializedView;
use crate::source::{MemorySource, Source};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Owner of a stream's scheduler task.
///
/// Dropping the handle does not stop the stream; call [`StreamHandle::stop`].
pub struct StreamHandle {
    id: String,
    state_rx: watch::Receiver<StreamState>,
    progress_rx: watch::Receiver<StreamProgress>,
    stop_tx: Arc<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
    source: Arc<dyn Source>,
    memory_source: Option<MemorySource>,
    view: Option<Arc<MaterializedView>>,
    metrics: Arc<StreamMetrics>,
    health: Arc<HealthCheck>,
}

pub(crate) struct HandleParts {
    pub(crate) id: String,
    pub(crate) state_rx: watch::Receiver<StreamState>,
    pub(crate) progress_rx: watch::Receiver<StreamProgress>,
    pub(crate) stop_tx: Arc<watch::Sender<bool>>,
    pub(crate) task: JoinHandle<Result<()>>,
    pub(crate) source: Arc<dyn Source>,
    pub(crate) memory_source: Option<MemorySource>,
    pub(crate) view: Option<Arc<MaterializedView>>,
    pub(crate) metrics: Arc<StreamMetrics>,
    pub(crate) health: Arc<HealthCheck>,
}

impl StreamHandle {
    pub(crate) fn new(parts: HandleParts) -> Self {
        Self {
            id: parts.id,
            state_rx: parts.state_rx,
            progress_rx: parts.progress_rx,
            stop_tx: parts.stop_tx,
            task: Mutex::new(Some(parts.task)),
            source: parts.source,
            memory_source: parts.memory_source,
            view: parts.view,
            metrics: parts.metrics,
            health: parts.health,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current scheduler state.
    pub fn state(&self) -> StreamState {
        self.state_rx.borrow().clone()
    }

    /// Latest committed progress.
    pub fn progress(&self) -> StreamProgress {
        self.progress_rx.borrow().clone()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.state_rx.clone()
    }

    /// Offset below which every record has been committed.
    pub fn committed_offset(&self) -> Offset {
        self.progress_rx.borrow().committed_offset
    }

    /// Whether the scheduler is still running.
    pub fn is_active(&self) -> bool {
        !self.state_rx.borrow().is_terminal()
    }

    /// The stream's view, if it has a view sink.
    pub fn view(&self) -> Option<&Arc<MaterializedView>> {
        self.view.as_ref()
    }

    /// Push handle for streams built on an in-memory source.
    pub fn memory_source(&self) -> Option<&MemorySource> {
        self.memory_source.as_ref()
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// Wait until everything below `offset` is committed.
    ///
    /// Fails if the stream stops or fails first.
    pub async fn wait_for_offset(&self, offset: Offset) -> Result<()> {
        let mut progress = self.progress_rx.clone();
        let mut state = self.state_rx.clone();

        loop {
            let committed = progress.borrow_and_update().committed_offset;
            if committed >= offset {
                return Ok(());
            }
            let current = state.borrow_and_update().clone();
            if current.is_terminal() {
                return Err(current.to_error());
            }

            let closed = tokio::select! {
                changed = progress.changed() => changed.is_err(),
                changed = state.changed() => changed.is_err(),
            };
            if closed {
                let committed = progress.borrow().committed_offset;
                if committed >= offset {
                    return Ok(());
                }
                let current = state.borrow().clone();
                return Err(current.to_error());
            }
        }
    }

    /// Wait until everything the source currently holds is committed.
    pub async fn process_all_available(&self) -> Result<()> {
        match self.source.latest_offset().await? {
            Some(latest) => self.wait_for_offset(latest).await,
            None => Err(Error::Config(format!(
                "Source {} cannot report its latest offset",
                self.source.name()
            ))),
        }
    }

    /// Ask the scheduler to stop after the in-flight batch.
    pub fn request_stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!(stream = %self.id, "Stop requested");
        }
    }

    /// Request a stop and wait for the scheduler to exit.
    pub async fn stop(&self) -> Result<()> {
        self.request_stop();
        self.await_termination().await
    }

    /// Wait for the scheduler to exit, returning its failure if it failed.
    pub async fn await_termination(&self) -> Result<()> {
        let task = self.task.lock().take();
        match task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::StreamFailed(format!("scheduler task aborted: {}", e))),
            },
            None => {
                let mut state = self.state_rx.clone();
                let current = state.wait_for(|s| s.is_terminal()).await.map(|s| s.clone());
                match current {
                    Ok(StreamState::Stopped) => Ok(()),
                    Ok(other) => Err(other.to_error()),
                    Err(_) => match self.state() {
                        StreamState::Stopped => Ok(()),
                        other => Err(other.to_error()),
                    },
                }
            }
        }
    }
}
