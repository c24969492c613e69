//! Source reading newline-delimited JSON files from a directory.
//!
//! Files are ordered by name and each non-empty line is one record. A
//! record's offset is its line index across all files in that order, so
//! files must be immutable once visible and named in arrival order
//! (e.g. `events-000001.jsonl`). Line counts are cached per file and
//! recomputed when a file's size changes.

use super::{PollResult, Source};
use crate::error::SourceError;
use crate::record::{Offset, RawRecord};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct FileInfo {
    size: u64,
    lines: u64,
}

/// Directory-backed source.
pub struct DirectorySource {
    name: String,
    path: PathBuf,
    extensions: Vec<String>,
    line_counts: Mutex<HashMap<PathBuf, FileInfo>>,
}

impl DirectorySource {
    pub fn new(path: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        let path = path.into();
        Self {
            name: format!("dir:{}", path.display()),
            path,
            extensions,
            line_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn list_files(&self) -> Result<Vec<(PathBuf, u64)>, SourceError> {
        let mut dir = match tokio::fs::read_dir(&self.path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.path, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&self.path, e))? {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| self.extensions.iter().any(|e| e == ext))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let meta = entry.metadata().await.map_err(|e| io_error(&path, e))?;
            if meta.is_file() {
                files.push((path, meta.len()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Line count of a file. On a cache miss the file is read, and its
    /// content is handed back so a poll does not read it again.
    async fn line_count(&self, path: &Path, size: u64) -> Result<(u64, Option<Vec<u8>>), SourceError> {
        if let Some(info) = self.line_counts.lock().get(path) {
            if info.size == size {
                return Ok((info.lines, None));
            }
        }
        let content = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
        let lines = record_lines(&content).count() as u64;
        self.line_counts
            .lock()
            .insert(path.to_path_buf(), FileInfo { size, lines });
        Ok((lines, Some(content)))
    }

    #[cfg(test)]
    fn cached_size(&self, path: &Path) -> Option<u64> {
        self.line_counts.lock().get(path).map(|info| info.size)
    }
}

#[async_trait]
impl Source for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self, since: Offset, max_records: usize) -> Result<PollResult, SourceError> {
        let files = self.list_files().await?;
        let mut records = Vec::new();
        let mut base = 0u64;

        for (path, size) in files {
            if records.len() >= max_records {
                break;
            }
            let (lines, content) = self.line_count(&path, size).await?;
            let file_end = base + lines;
            if file_end <= since.0 {
                base = file_end;
                continue;
            }

            let content = match content {
                Some(content) => content,
                None => tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))?,
            };
            let arrival: DateTime<Utc> = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            let skip = since.0.saturating_sub(base) as usize;
            for (i, line) in record_lines(&content).enumerate().skip(skip) {
                if records.len() >= max_records {
                    break;
                }
                records.push(RawRecord {
                    offset: Offset(base + i as u64),
                    payload: Bytes::copy_from_slice(line),
                    arrival,
                });
            }
            debug!(file = %path.display(), base, lines, "Read source file");
            base = file_end;
        }

        let next_offset = records.last().map_or(since, |r| r.offset.next());
        Ok(PollResult {
            records,
            next_offset,
        })
    }

    async fn latest_offset(&self) -> Result<Option<Offset>, SourceError> {
        let mut total = 0u64;
        for (path, size) in self.list_files().await? {
            total += self.line_count(&path, size).await?.0;
        }
        Ok(Some(Offset(total)))
    }
}

/// Non-blank lines of a file, without line terminators.
fn record_lines(content: &[u8]) -> impl Iterator<Item = &[u8]> {
    content
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
}

fn io_error(path: &Path, err: std::io::Error) -> SourceError {
    SourceError::Io(format!("{}: {}", path.display(), err))
}
