//! Append-only, file-backed checkpoint log.
//!
//! Entries are newline-delimited JSON in `checkpoint-<seq>.jsonl` files,
//! read back in sequence order. Each process start opens a fresh file.
//! After `compact_interval_entries` entries the log rotates on the next
//! commit: the new file starts with a `Snapshot` of the committed state,
//! which makes older files redundant, and files beyond `max_log_files` are
//! removed oldest-first.

use super::entries::{CheckpointEntry, CheckpointRecord};
use super::recovery::RecoveryState;
use super::CheckpointStore;
use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

const FILE_PREFIX: &str = "checkpoint-";
const FILE_SUFFIX: &str = ".jsonl";

/// Committed state tracked for snapshots and monotonicity checks.
#[derive(Debug, Default)]
struct Tracked {
    committed: Option<CheckpointRecord>,
    batches_committed: u64,
}

/// File-backed checkpoint store for one stream.
pub struct CheckpointLog {
    dir: PathBuf,
    compact_interval_entries: usize,
    max_log_files: usize,
    writer: Mutex<BufWriter<File>>,
    current_path: Mutex<PathBuf>,
    current_seq: AtomicU64,
    entries_since_snapshot: AtomicU64,
    tracked: Mutex<Tracked>,
}

impl CheckpointLog {
    /// Open the log in `dir`, starting a new file after any existing ones.
    pub fn open(dir: impl Into<PathBuf>, config: &CheckpointConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            write_failed(format!(
                "Failed to create checkpoint directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let seq = list_log_files(&dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);
        let path = file_path(&dir, seq);
        let file = open_append(&path)?;

        info!(path = %path.display(), "Checkpoint log opened");

        let log = Self {
            dir,
            compact_interval_entries: config.compact_interval_entries.max(1),
            max_log_files: config.max_log_files.max(2),
            writer: Mutex::new(BufWriter::new(file)),
            current_path: Mutex::new(path),
            current_seq: AtomicU64::new(seq),
            entries_since_snapshot: AtomicU64::new(0),
            tracked: Mutex::new(Tracked::default()),
        };

        // Seed commit tracking so monotonicity holds across restarts.
        let state = RecoveryState::from_entries(log.read_all_entries()?)?;
        *log.tracked.lock() = Tracked {
            committed: state.committed,
            batches_committed: state.batches_committed,
        };

        Ok(log)
    }

    /// Open the log for `stream_id` under the configured checkpoint dir.
    pub fn open_for_stream(stream_id: &str, config: &CheckpointConfig) -> Result<Self> {
        Self::open(config.stream_dir(stream_id), config)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the path to the current log file.
    pub fn current_path(&self) -> PathBuf {
        self.current_path.lock().clone()
    }

    /// Last committed record written or recovered by this log.
    pub fn last_committed(&self) -> Option<CheckpointRecord> {
        self.tracked.lock().committed.clone()
    }

    /// Append an entry and sync it to disk.
    pub fn append_entry(&self, entry: CheckpointEntry) -> Result<()> {
        let record = entry.as_record();
        if let Some(record) = &record {
            self.check_monotonic(record)?;
        }

        self.write_line(&entry)?;
        self.entries_since_snapshot.fetch_add(1, Ordering::SeqCst);

        if let Some(record) = record {
            {
                let mut tracked = self.tracked.lock();
                tracked.committed = Some(record);
                tracked.batches_committed += 1;
            }
            let count = self.entries_since_snapshot.load(Ordering::SeqCst);
            if count >= self.compact_interval_entries as u64 {
                // The commit is already durable; a failed rotation is retried
                // on the next commit.
                if let Err(e) = self.compact() {
                    warn!(
                        dir = %self.dir.display(),
                        entries = %count,
                        error = %e,
                        "Checkpoint log compaction failed"
                    );
                }
            }
        }

        Ok(())
    }

    fn check_monotonic(&self, record: &CheckpointRecord) -> Result<()> {
        let tracked = self.tracked.lock();
        if let Some(prev) = &tracked.committed {
            if record.end_offset < prev.end_offset {
                return Err(Error::Checkpoint(CheckpointError::NonMonotonic {
                    committed: prev.end_offset.0,
                    attempted: record.end_offset.0,
                }));
            }
            if record.batch_id <= prev.batch_id {
                return Err(Error::Checkpoint(CheckpointError::WriteFailed(format!(
                    "batch {} already committed (last committed batch {})",
                    record.batch_id, prev.batch_id
                ))));
            }
        }
        Ok(())
    }

    fn write_line(&self, entry: &CheckpointEntry) -> Result<()> {
        let json = serde_json::to_string(entry).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json).map_err(|e| write_failed(e.to_string()))?;
        writer.flush().map_err(|e| write_failed(e.to_string()))?;
        writer
            .get_ref()
            .sync_data()
            .map_err(|e| write_failed(format!("Failed to fsync checkpoint log: {}", e)))?;
        Ok(())
    }

    /// Rotate to a new file that starts with a snapshot, then drop old files.
    pub fn compact(&self) -> Result<()> {
        let snapshot_id = Uuid::new_v4().to_string();
        let snapshot = {
            let tracked = self.tracked.lock();
            CheckpointEntry::Snapshot {
                snapshot_id: snapshot_id.clone(),
                committed: tracked.committed.clone(),
                batches_committed: tracked.batches_committed,
                timestamp: Utc::now(),
            }
        };

        self.rotate_log_file()?;
        self.write_line(&snapshot)?;
        let entries = self.entries_since_snapshot.swap(0, Ordering::SeqCst);
        self.cleanup_old_files()?;

        info!(
            snapshot_id = %snapshot_id,
            entries = %entries,
            "Checkpoint log compacted"
        );
        Ok(())
    }

    fn rotate_log_file(&self) -> Result<()> {
        let seq = self.current_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let new_path = file_path(&self.dir, seq);
        let new_file = open_append(&new_path)?;

        let mut writer = self.writer.lock();
        let mut current_path = self.current_path.lock();

        writer
            .flush()
            .map_err(|e| write_failed(format!("Failed to flush before rotation: {}", e)))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| write_failed(format!("Failed to fsync before rotation: {}", e)))?;

        let old_path = std::mem::replace(&mut *current_path, new_path);
        *writer = BufWriter::new(new_file);

        debug!(old_path = %old_path.display(), "Checkpoint log rotated to new file");
        Ok(())
    }

    fn cleanup_old_files(&self) -> Result<()> {
        let files = list_log_files(&self.dir)?;
        let current = self.current_path();
        let excess = files.len().saturating_sub(self.max_log_files);

        for (_, path) in files.into_iter().take(excess) {
            if path == current {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed old checkpoint log file"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove old checkpoint log file")
                }
            }
        }
        Ok(())
    }

    /// Read all entries from all log files, oldest first.
    ///
    /// An unparseable final line of a file is a write torn by a crash and is
    /// skipped. Anything else unparseable is corruption.
    pub fn read_all_entries(&self) -> Result<Vec<CheckpointEntry>> {
        read_entries(&self.dir)
    }

    /// Sync pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .flush()
            .map_err(|e| write_failed(format!("Failed to flush: {}", e)))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| write_failed(format!("Failed to sync: {}", e)))?;
        Ok(())
    }
}

impl CheckpointStore for CheckpointLog {
    fn recover(&self) -> Result<RecoveryState> {
        RecoveryState::recover_from(self)
    }

    fn append(&self, entry: CheckpointEntry) -> Result<()> {
        self.append_entry(entry)
    }
}

/// Read every entry in a checkpoint directory without opening it for writes.
pub fn read_entries(dir: &Path) -> Result<Vec<CheckpointEntry>> {
    let mut entries = Vec::new();

    for (_, path) in list_log_files(dir)? {
        let file = File::open(&path).map_err(|e| {
            Error::Checkpoint(CheckpointError::RecoveryFailed(format!(
                "Failed to open {}: {}",
                path.display(),
                e
            )))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()
            .map_err(|e| corrupted(&file_name, 0, e.to_string()))?;
        let last_line = lines.iter().rposition(|l| !l.trim().is_empty());

        for (line_num, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if Some(line_num) == last_line => {
                    warn!(
                        file = %file_name,
                        line = line_num + 1,
                        error = %e,
                        "Ignoring torn checkpoint entry at end of file"
                    );
                }
                Err(e) => {
                    return Err(corrupted(
                        &file_name,
                        line_num as u64 + 1,
                        format!("JSON parse error: {}", e),
                    ))
                }
            }
        }
    }

    debug!(entries = %entries.len(), dir = %dir.display(), "Read checkpoint entries");
    Ok(entries)
}

/// Log files sorted by sequence number.
fn list_log_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Checkpoint(CheckpointError::RecoveryFailed(format!(
                "Failed to read checkpoint directory {}: {}",
                dir.display(),
                e
            ))))
        }
    };

    let mut files: Vec<(u64, PathBuf)> = read_dir
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let seq = name
                .strip_prefix(FILE_PREFIX)?
                .strip_suffix(FILE_SUFFIX)?
                .parse::<u64>()
                .ok()?;
            Some((seq, e.path()))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn file_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{}{:010}{}", FILE_PREFIX, seq, FILE_SUFFIX))
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            write_failed(format!(
                "Failed to open checkpoint log {}: {}",
                path.display(),
                e
            ))
        })
}

fn write_failed(message: String) -> Error {
    Error::Checkpoint(CheckpointError::WriteFailed(message))
}

fn corrupted(file: &str, position: u64, message: String) -> Error {
    Error::Checkpoint(CheckpointError::Corrupted {
        file: file.to_string(),
        position,
        message,
    })
}
