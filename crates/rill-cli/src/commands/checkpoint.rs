//! Checkpoint inspection command.

use anyhow::Result;
use rill_core::checkpoint::{read_entries, RecoveryState};
use rill_core::Config;

/// Print what a stream would recover from its checkpoint log.
///
/// Reads the log without opening it for writes, so it is safe to run next
/// to a live stream.
pub fn inspect(config: &Config, stream_id: &str, tail: usize) -> Result<()> {
    if config.stream(stream_id).is_none() {
        anyhow::bail!("Configuration error: unknown stream {}", stream_id);
    }

    let dir = config.checkpoint.stream_dir(stream_id);
    let entries = read_entries(&dir)?;
    if entries.is_empty() {
        println!("No checkpoint entries in {}", dir.display());
        return Ok(());
    }

    let skip = entries.len().saturating_sub(tail);
    let recent: Vec<String> = entries[skip..]
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<_, _>>()?;

    let state = RecoveryState::from_entries(entries)?;
    println!("{}", serde_json::to_string_pretty(&state.summary())?);

    if !recent.is_empty() {
        println!("\nLast {} entries:", recent.len());
        for line in recent {
            println!("{}", line);
        }
    }

    Ok(())
}
