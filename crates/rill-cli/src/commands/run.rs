//! Run command implementation.

use crate::server::{start_server, ServerState};
use anyhow::{bail, Result};
use rill_core::health::HealthCheck;
use rill_core::{start_all, Config, StreamHandle, ViewCatalog};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Overrides and switches for `rill run`.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Run only these streams; all when empty
    pub streams: Vec<String>,
    /// Replace every file sink root
    pub output_root: Option<String>,
    /// Replace the checkpoint dir
    pub checkpoint_dir: Option<PathBuf>,
    /// Replace the HTTP port
    pub port: Option<u16>,
    /// Do not serve HTTP
    pub no_server: bool,
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every stream stopped on its own
    Completed,
    /// Stopped by SIGINT or SIGTERM
    Interrupted,
}

/// Apply CLI overrides and stream selection to a loaded configuration.
pub fn apply_options(config: &mut Config, options: &RunOptions) -> Result<()> {
    if !options.streams.is_empty() {
        for id in &options.streams {
            if config.stream(id).is_none() {
                bail!("Configuration error: unknown stream {}", id);
            }
        }
        config.streams.retain(|s| options.streams.contains(&s.id));
    }

    if let Some(dir) = &options.checkpoint_dir {
        config.checkpoint.dir = dir.clone();
    }
    if let Some(port) = options.port {
        config.monitoring.http_port = port;
    }

    if let Some(root) = &options.output_root {
        // Streams keep separate trees under a shared root.
        let per_stream = config.streams.len() > 1;
        for stream in &mut config.streams {
            if let Some(files) = &mut stream.sinks.files {
                files.root = if per_stream {
                    Path::new(root).join(&stream.id).to_string_lossy().into_owned()
                } else {
                    root.clone()
                };
            }
        }
    }

    config.validate()?;
    Ok(())
}

/// Run the configured streams until they stop or a signal arrives.
pub async fn run(mut config: Config, options: RunOptions) -> Result<Outcome> {
    apply_options(&mut config, &options)?;

    info!(
        streams = ?config.streams.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        checkpoint_dir = %config.checkpoint.dir.display(),
        "Starting streams"
    );

    let health = Arc::new(HealthCheck::new());
    let catalog = ViewCatalog::new();
    let handles: Vec<Arc<StreamHandle>> = start_all(&config, &catalog, health.clone())?
        .into_iter()
        .map(Arc::new)
        .collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = if options.no_server {
        None
    } else {
        let state = Arc::new(ServerState {
            health: health.clone(),
            catalog: catalog.clone(),
            streams: handles.clone(),
        });
        Some(tokio::spawn(start_server(
            state,
            config.monitoring.http_port,
            shutdown_rx,
        )))
    };

    let interrupted = tokio::select! {
        _ = shutdown_signal() => true,
        _ = wait_all(&handles) => false,
    };

    if interrupted {
        for handle in &handles {
            handle.request_stop();
        }
    }

    let mut first_error = None;
    for handle in &handles {
        match handle.await_termination().await {
            Ok(()) => info!(stream = %handle.id(), "Stream stopped"),
            Err(e) => {
                error!(stream = %handle.id(), error = %e, "Stream failed");
                first_error.get_or_insert(e);
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!(error = %e, "HTTP server task failed");
        }
    }

    if let Some(e) = first_error {
        return Err(e.into());
    }

    info!("All streams stopped");
    Ok(if interrupted {
        Outcome::Interrupted
    } else {
        Outcome::Completed
    })
}

async fn wait_all(handles: &[Arc<StreamHandle>]) {
    for handle in handles {
        let mut state = handle.state_changes();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
