//! rill CLI - micro-batch JSON stream ingestion runner.

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::query::QueryArgs;
use commands::run::{Outcome, RunOptions};
use rill_core::config::LogFormat;
use rill_core::Config;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, unknown stream, bad schema)
    ConfigError = 1,
    /// Source error (unreadable input, poll failure)
    SourceError = 2,
    /// Sink error (file publish, view capacity)
    SinkError = 3,
    /// Query error (unknown view, bad expression)
    QueryError = 4,
    /// Checkpoint log error
    CheckpointError = 5,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Convert an error to an exit code, by type where possible and by message otherwise.
    fn from_error(error: &anyhow::Error) -> Self {
        let core = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<rill_core::Error>());

        match core {
            Some(rill_core::Error::Config(_)) | Some(rill_core::Error::Schema(_)) => {
                ExitCode::ConfigError
            }
            Some(rill_core::Error::Source(_)) => ExitCode::SourceError,
            Some(rill_core::Error::Sink(_)) => ExitCode::SinkError,
            Some(rill_core::Error::Query(_)) => ExitCode::QueryError,
            Some(rill_core::Error::Checkpoint(_)) => ExitCode::CheckpointError,
            Some(rill_core::Error::Shutdown) => ExitCode::SignalInterrupt,
            // A failed stream carries its cause as text.
            _ => Self::from_message(&error.to_string()),
        }
    }

    fn from_message(message: &str) -> Self {
        let message = message.to_lowercase();

        if message.contains("configuration error")
            || message.contains("schema error")
            || message.contains("toml")
        {
            ExitCode::ConfigError
        } else if message.contains("source error") {
            ExitCode::SourceError
        } else if message.contains("sink error") {
            ExitCode::SinkError
        } else if message.contains("query") {
            ExitCode::QueryError
        } else if message.contains("checkpoint") {
            ExitCode::CheckpointError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "rill")]
#[command(about = "Micro-batch JSON stream ingestion runner", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "rill.toml")]
    config: PathBuf,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run configured streams until they stop or a signal arrives
    Run {
        /// Run only this stream (repeatable)
        #[arg(long = "stream")]
        streams: Vec<String>,

        /// Override the root directory of every file sink
        #[arg(long)]
        output_root: Option<String>,

        /// Override the checkpoint directory
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Override the HTTP port
        #[arg(long)]
        port: Option<u16>,

        /// Do not start the HTTP server
        #[arg(long)]
        no_server: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show status and health of a running instance
    Status {
        /// Base URL of the HTTP server
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Query a materialized view of a running instance
    Query {
        /// View name
        view: String,

        /// Comma-separated columns
        #[arg(long)]
        select: Option<String>,

        /// Filter expression, e.g. "temp > 65 AND zipcode = '12345'"
        #[arg(long = "where")]
        filter: Option<String>,

        /// Maximum rows to return
        #[arg(long)]
        limit: Option<usize>,

        /// Print one JSON object per row
        #[arg(long)]
        json: bool,

        /// Base URL of the HTTP server
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Inspect a stream's checkpoint log
    Checkpoint {
        /// Stream id
        #[arg(long)]
        stream: String,

        /// Also print the last N entries
        #[arg(long, default_value_t = 0)]
        tail: usize,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Config is optional here; logging falls back to JSON at info
    let monitoring = std::fs::read_to_string(&cli.config)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                monitoring
                    .as_ref()
                    .map_or("info", |m| m.log_level.as_filter()),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    let log_format = monitoring.map(|m| m.log_format).unwrap_or(LogFormat::Json);
    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            streams,
            output_root,
            checkpoint_dir,
            port,
            no_server,
        } => {
            let config = load_config(&cli.config)?;
            let options = RunOptions {
                streams,
                output_root,
                checkpoint_dir,
                port,
                no_server,
            };
            return Ok(match commands::run::run(config, options).await? {
                Outcome::Completed => ExitCode::Success,
                Outcome::Interrupted => ExitCode::SignalInterrupt,
            });
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            println!(
                "Configuration is valid ({} streams: {})",
                config.streams.len(),
                config
                    .streams
                    .iter()
                    .map(|s| s.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
        }

        Commands::Query {
            view,
            select,
            filter,
            limit,
            json,
            url,
        } => {
            let args = QueryArgs {
                view,
                select,
                filter,
                limit,
                json,
            };
            commands::query::run(&url, args).await?;
        }

        Commands::Checkpoint { stream, tail } => {
            let config = load_config(&cli.config)?;
            commands::checkpoint::inspect(&config, &stream, tail)?;
        }
    }

    Ok(ExitCode::Success)
}

/// Load and validate the configuration file.
fn load_config(path: &Path) -> Result<Config> {
    Ok(Config::from_file(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{CheckpointError, SinkError};

    #[test]
    fn test_exit_code_from_core_error() {
        let err: anyhow::Error = rill_core::Error::Config("bad".into()).into();
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);

        let err: anyhow::Error = rill_core::Error::Sink(SinkError::CapacityExceeded {
            view: "weather".into(),
            limit: 1,
        })
        .into();
        assert_eq!(ExitCode::from_error(&err), ExitCode::SinkError);

        let err: anyhow::Error =
            rill_core::Error::Checkpoint(CheckpointError::WriteFailed("disk".into())).into();
        assert_eq!(ExitCode::from_error(&err), ExitCode::CheckpointError);
    }

    #[test]
    fn test_exit_code_from_failed_stream() {
        let err: anyhow::Error =
            rill_core::Error::StreamFailed("Sink error: write failed".into()).into();
        assert_eq!(ExitCode::from_error(&err), ExitCode::SinkError);

        let err = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&err), ExitCode::RuntimeError);

        let err = anyhow::anyhow!("Configuration error: unknown stream x");
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "rill",
            "--config",
            "x.toml",
            "run",
            "--stream",
            "a",
            "--stream",
            "b",
            "--no-server",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        match cli.command {
            Commands::Run {
                streams, no_server, ..
            } => {
                assert_eq!(streams, vec!["a", "b"]);
                assert!(no_server);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parses_query() {
        let cli = Cli::try_parse_from([
            "rill", "query", "weather", "--where", "temp > 65", "--limit", "3",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("rill.toml"));
        match cli.command {
            Commands::Query {
                view, filter, limit, ..
            } => {
                assert_eq!(view, "weather");
                assert_eq!(filter.as_deref(), Some("temp > 65"));
                assert_eq!(limit, Some(3));
            }
            _ => panic!("expected query"),
        }
    }
}
