//! End-to-end tests for rill-core streams.
//!
//! Every test runs real schedulers against a local checkpoint directory and
//! a local output root under a temp dir.

use async_trait::async_trait;
use rill_core::checkpoint::{read_entries, CheckpointEntry, CheckpointLog, CheckpointStore, RecoveryState};
use rill_core::config::{CheckpointConfig, Config, SchedulerConfig, StreamConfig};
use rill_core::sink::{Sink, SinkReceipt};
use rill_core::source::MemorySource;
use rill_core::{Batch, Offset, Query, SinkError, StreamBuilder, StreamHandle, StreamState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

const WEATHER: &str = r#"
schema = [
    { name = "timestamp", type = "timestamp" },
    { name = "zipcode", type = "string" },
    { name = "temperature", type = "integer" },
]
partition_by = [
    { source = "zipcode" },
    { name = "hour", source = "timestamp", transform = "hour" },
]
"#;

fn weather_stream(id: &str, files_root: Option<&Path>, extra: &str) -> StreamConfig {
    let mut text = format!(
        "id = \"{}\"\n{}\nsource = {{ kind = \"memory\" }}\n\n[sinks.view]\n",
        id, WEATHER
    );
    if let Some(root) = files_root {
        text.push_str(&format!("\n[sinks.files]\nroot = \"{}\"\n", root.display()));
    }
    text.push_str(extra);
    toml::from_str(&text).unwrap()
}

fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_ms: 10,
        poll_timeout_ms: 1_000,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 20,
        ..SchedulerConfig::default()
    }
}

fn checkpoint_config(dir: &Path) -> CheckpointConfig {
    CheckpointConfig {
        dir: dir.to_path_buf(),
        ..CheckpointConfig::default()
    }
}

fn builder(stream: StreamConfig, checkpoints: &Path) -> StreamBuilder {
    StreamBuilder::new(stream)
        .with_scheduler_config(fast_scheduler())
        .with_checkpoint_config(checkpoint_config(checkpoints))
}

fn reading(timestamp: &str, zipcode: &str, temperature: i64) -> String {
    serde_json::json!({
        "timestamp": timestamp,
        "zipcode": zipcode,
        "temperature": temperature,
    })
    .to_string()
}

async fn wait_for(handle: &StreamHandle, offset: u64) {
    tokio::time::timeout(WAIT, handle.wait_for_offset(Offset(offset)))
        .await
        .expect("timed out waiting for commit")
        .unwrap();
}

async fn wait_for_state(handle: &StreamHandle, predicate: impl Fn(&StreamState) -> bool) -> StreamState {
    let mut states = handle.state_changes();
    let state = tokio::time::timeout(WAIT, states.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for state")
        .unwrap()
        .clone();
    state
}

/// Data files under `root`, relative and sorted.
fn data_files(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path.strip_prefix(root).unwrap().to_string_lossy().into_owned());
            }
        }
    }
    out.sort();
    out
}

fn entry_counts(dir: &Path, type_name: &str) -> usize {
    read_entries(dir)
        .unwrap()
        .iter()
        .filter(|e| e.type_name() == type_name)
        .count()
}

mod end_to_end {
    use super::*;

    #[tokio::test]
    async fn test_record_lands_in_partition_directory() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let handle = builder(weather_stream("weather", Some(&out), ""), &temp.path().join("ckpt"))
            .start()
            .unwrap();

        let source = handle.memory_source().unwrap();
        source.push(r#"{"timestamp":"2018-10-01T14:05:00","zipcode":"12345","temperature":75}"#);
        tokio::time::timeout(WAIT, handle.process_all_available())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            data_files(&out),
            vec!["zipcode=12345/hour=14/part-00000000000000000000-00000.jsonl"]
        );
        let content = std::fs::read_to_string(out.join(&data_files(&out)[0])).unwrap();
        let row: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(row["zipcode"], "12345");
        assert_eq!(row["temperature"], 75);
        assert_eq!(row["timestamp"], "2018-10-01T14:05:00Z");

        let view = handle.view().unwrap();
        assert_eq!(view.row_count(), 1);

        let progress = handle.progress();
        assert_eq!(progress.batch_id, Some(0));
        assert_eq!(progress.committed_offset, Offset(1));
        assert_eq!(progress.last_batch_rows.get("files"), Some(&1));
        assert_eq!(progress.last_batch_rows.get("view"), Some(&1));

        handle.stop().await.unwrap();
        assert_eq!(handle.state(), StreamState::Stopped);
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_filter_query_over_committed_batches() {
        let temp = TempDir::new().unwrap();
        let catalog = rill_core::ViewCatalog::new();
        let handle = builder(weather_stream("weather", None, ""), temp.path())
            .with_catalog(catalog.clone())
            .start()
            .unwrap();
        let source = handle.memory_source().unwrap();

        source.push(reading("2018-10-01T14:05:00", "22334", 70));
        wait_for(&handle, 1).await;
        source.push(reading("2018-10-01T15:05:00", "22334", 60));
        source.push(reading("2018-10-01T15:10:00", "12345", 80));
        wait_for(&handle, 3).await;
        assert!(handle.progress().batches_committed >= 2);

        let query = Query::parse(None, Some("zipcode = '22334' and temperature > 65"), None).unwrap();
        let result = catalog.query("weather", &query).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows[0]["temperature"], 70);

        let query = Query::parse(Some("zipcode"), Some("temperature >= 60"), Some(2)).unwrap();
        let result = catalog.query("weather", &query).unwrap();
        assert_eq!(result.columns, vec!["zipcode"]);
        assert_eq!(result.len(), 2);

        handle.stop().await.unwrap();
        // The view stays queryable after the stream stops.
        assert_eq!(catalog.get("weather").unwrap().row_count(), 3);
    }

    #[tokio::test]
    async fn test_null_timestamp_is_kept_out_of_files_only() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let handle = builder(weather_stream("weather", Some(&out), ""), &temp.path().join("ckpt"))
            .start()
            .unwrap();
        let source = handle.memory_source().unwrap();

        source.push(reading("2018-10-01T14:05:00", "12345", 75));
        source.push(r#"{"zipcode":"12345","temperature":71}"#);
        source.push("not json at all");
        wait_for(&handle, 3).await;

        let files = data_files(&out);
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(out.join(&files[0])).unwrap();
        assert_eq!(content.lines().count(), 1);

        let view = handle.view().unwrap();
        assert_eq!(view.row_count(), 3);
        let malformed: Vec<_> = view
            .snapshot()
            .records()
            .filter(|r| r.is_malformed())
            .map(|r| r.offset)
            .collect();
        assert_eq!(malformed, vec![Offset(2)]);
        assert_eq!(handle.metrics().decode_failures(), 1);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_parquet_output() {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let stream = weather_stream("weather", Some(&out), "format = \"parquet\"\n");
        let source = MemorySource::new("weather");
        source.push(reading("2018-10-01T14:05:00", "12345", 75));
        source.push(reading("2018-10-01T14:45:00", "12345", 77));
        let handle = builder(stream, &temp.path().join("ckpt"))
            .with_source(Arc::new(source))
            .start()
            .unwrap();
        wait_for(&handle, 2).await;
        handle.stop().await.unwrap();

        let files = data_files(&out);
        assert_eq!(files, vec!["zipcode=12345/hour=14/part-00000000000000000000-00000.parquet"]);

        let file = std::fs::File::open(out.join(&files[0])).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_directory_source() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(
            input.join("events-000001.jsonl"),
            format!(
                "{}\n{}\n",
                reading("2018-10-01T14:05:00", "12345", 75),
                reading("2018-10-01T15:05:00", "22334", 60)
            ),
        )
        .unwrap();
        std::fs::write(input.join("ignored.txt"), "{}\n").unwrap();

        let text = format!(
            "id = \"weather\"\n{}\n[source]\nkind = \"directory\"\npath = \"{}\"\n\n[sinks.view]\n",
            WEATHER,
            input.display()
        );
        let stream: StreamConfig = toml::from_str(&text).unwrap();
        let handle = builder(stream, &temp.path().join("ckpt")).start().unwrap();
        assert!(handle.memory_source().is_none());

        tokio::time::timeout(WAIT, handle.process_all_available())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.committed_offset(), Offset(2));

        std::fs::write(
            input.join("events-000002.jsonl"),
            format!("{}\n", reading("2018-10-01T16:05:00", "12345", 66)),
        )
        .unwrap();
        wait_for(&handle, 3).await;
        assert_eq!(handle.view().unwrap().row_count(), 3);

        handle.stop().await.unwrap();
    }
}

mod recovery {
    use super::*;
    use rill_core::{CheckpointError, Error};

    /// Checkpoint store that refuses batch commits while `fail` is set.
    struct FailingCommits {
        inner: CheckpointLog,
        fail: AtomicBool,
    }

    impl CheckpointStore for FailingCommits {
        fn recover(&self) -> rill_core::Result<RecoveryState> {
            self.inner.recover()
        }

        fn append(&self, entry: CheckpointEntry) -> rill_core::Result<()> {
            if self.fail.load(Ordering::SeqCst) && matches!(entry, CheckpointEntry::BatchCommitted { .. }) {
                return Err(Error::Checkpoint(CheckpointError::WriteFailed("disk full".into())));
            }
            self.inner.append(entry)
        }
    }

    #[tokio::test]
    async fn test_crash_before_commit_does_not_duplicate_files() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let checkpoints = temp.path().join("ckpt");
        let stream = weather_stream("weather", Some(&out), "");
        let source = MemorySource::new("weather");
        source.push(reading("2018-10-01T14:05:00", "12345", 75));
        source.push(reading("2018-10-01T15:05:00", "22334", 60));

        let store = Arc::new(FailingCommits {
            inner: CheckpointLog::open_for_stream("weather", &checkpoint_config(&checkpoints)).unwrap(),
            fail: AtomicBool::new(true),
        });
        let handle = builder(stream.clone(), &checkpoints)
            .with_scheduler_config(SchedulerConfig {
                max_commit_retries: 0,
                ..fast_scheduler()
            })
            .with_source(Arc::new(source.clone()))
            .with_checkpoint_store(store.clone())
            .start()
            .unwrap();

        let err = tokio::time::timeout(WAIT, handle.await_termination())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Checkpoint(CheckpointError::WriteFailed(_))));
        assert!(matches!(handle.state(), StreamState::Failed(_)));
        assert_eq!(handle.committed_offset(), Offset::ZERO);
        assert_eq!(data_files(&out).len(), 2);
        drop(handle);
        drop(store);

        let stream_dir = checkpoints.join("weather");
        let state = RecoveryState::from_entries(read_entries(&stream_dir).unwrap()).unwrap();
        assert!(state.needs_replay());
        assert_eq!(state.next_offset(), Offset::ZERO);

        // Restart against the real log: the batch is replayed, files are not rewritten.
        let handle = builder(stream, &checkpoints)
            .with_source(Arc::new(source.clone()))
            .start()
            .unwrap();
        wait_for(&handle, 2).await;
        assert_eq!(handle.progress().batch_id, Some(0));
        assert_eq!(handle.view().unwrap().row_count(), 2);
        assert_eq!(data_files(&out).len(), 2);

        source.push(reading("2018-10-01T16:05:00", "12345", 66));
        wait_for(&handle, 3).await;
        handle.stop().await.unwrap();

        assert_eq!(
            data_files(&out),
            vec![
                "zipcode=12345/hour=14/part-00000000000000000000-00000.jsonl",
                "zipcode=12345/hour=16/part-00000000000000000001-00000.jsonl",
                "zipcode=22334/hour=15/part-00000000000000000000-00001.jsonl",
            ]
        );
        assert_eq!(entry_counts(&stream_dir, "SinkCommitted"), 2);
        assert_eq!(entry_counts(&stream_dir, "BatchCommitted"), 2);
        assert_eq!(entry_counts(&stream_dir, "StreamFailed"), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_no_files() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let checkpoints = temp.path().join("ckpt");
        // A non-empty directory where the second partition's file goes.
        let blocker = "zipcode=22334/hour=15/part-00000000000000000000-00001.jsonl/keep";
        std::fs::create_dir_all(out.join(blocker).parent().unwrap()).unwrap();
        std::fs::write(out.join(blocker), "").unwrap();

        let handle = builder(weather_stream("weather", Some(&out), ""), &checkpoints)
            .start()
            .unwrap();
        let source = handle.memory_source().unwrap();
        source.push_all([
            reading("2018-10-01T14:05:00", "12345", 75),
            reading("2018-10-01T15:05:00", "22334", 60),
        ]);

        let err = tokio::time::timeout(WAIT, handle.await_termination())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Sink(SinkError::Publish { .. })));
        assert_eq!(handle.committed_offset(), Offset::ZERO);

        // Neither the first partition's file nor anything staged survives.
        assert_eq!(data_files(&out), vec![blocker]);

        let stream_dir = checkpoints.join("weather");
        assert_eq!(entry_counts(&stream_dir, "SinkCommitted"), 0);
        assert_eq!(entry_counts(&stream_dir, "BatchCommitted"), 0);
        assert_eq!(entry_counts(&stream_dir, "StreamFailed"), 1);
    }

    #[tokio::test]
    async fn test_replay_rewrites_partially_published_batch() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let checkpoints = temp.path().join("ckpt");
        let stream = weather_stream("weather", Some(&out), "");
        let source = MemorySource::new("weather");
        source.push(reading("2018-10-01T14:05:00", "12345", 75));
        source.push(reading("2018-10-01T15:05:00", "22334", 60));

        // A previous run planned batch 0 and published one of its two files
        // before crashing, so no SinkCommitted was logged.
        {
            let log = CheckpointLog::open_for_stream("weather", &checkpoint_config(&checkpoints)).unwrap();
            let planned: CheckpointEntry = serde_json::from_value(serde_json::json!({
                "type": "BatchPlanned", "batch_id": 0, "start": 0, "end": 2,
                "record_count": 2, "timestamp": "2018-10-01T16:00:00Z"
            }))
            .unwrap();
            log.append_entry(planned).unwrap();
        }
        let first = out.join("zipcode=12345/hour=14/part-00000000000000000000-00000.jsonl");
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, "{\"partial\":true}\n").unwrap();

        let handle = builder(stream, &checkpoints)
            .with_source(Arc::new(source.clone()))
            .start()
            .unwrap();
        wait_for(&handle, 2).await;
        assert_eq!(handle.progress().batch_id, Some(0));
        handle.stop().await.unwrap();

        assert_eq!(
            data_files(&out),
            vec![
                "zipcode=12345/hour=14/part-00000000000000000000-00000.jsonl",
                "zipcode=22334/hour=15/part-00000000000000000000-00001.jsonl",
            ]
        );
        let content = std::fs::read_to_string(&first).unwrap();
        assert_eq!(content.lines().count(), 1);
        let row: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(row["temperature"], 75);

        let stream_dir = checkpoints.join("weather");
        assert_eq!(entry_counts(&stream_dir, "BatchPlanned"), 1);
        assert_eq!(entry_counts(&stream_dir, "SinkCommitted"), 1);
        assert_eq!(entry_counts(&stream_dir, "BatchCommitted"), 1);
    }

    #[tokio::test]
    async fn test_failed_log_rotation_does_not_fail_commit() {
        let temp = TempDir::new().unwrap();
        let checkpoints = temp.path().join("ckpt");
        let handle = builder(weather_stream("weather", None, ""), &checkpoints)
            .with_checkpoint_config(CheckpointConfig {
                compact_interval_entries: 3,
                ..checkpoint_config(&checkpoints)
            })
            .start()
            .unwrap();

        // The log opened file 1; block the file it rotates to.
        let stream_dir = checkpoints.join("weather");
        let blocked = stream_dir.join("checkpoint-0000000002.jsonl");
        std::fs::create_dir(&blocked).unwrap();

        let source = handle.memory_source().unwrap();
        source.push(reading("2018-10-01T14:05:00", "12345", 75));
        wait_for(&handle, 1).await;
        assert_eq!(handle.state(), StreamState::Idle);
        handle.stop().await.unwrap();

        std::fs::remove_dir(&blocked).unwrap();
        assert_eq!(entry_counts(&stream_dir, "BatchCommitted"), 1);
        assert_eq!(entry_counts(&stream_dir, "StreamFailed"), 0);
        assert_eq!(entry_counts(&stream_dir, "StreamStopped"), 1);
    }

    #[tokio::test]
    async fn test_restart_resumes_after_committed_offset() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let checkpoints = temp.path().join("ckpt");
        let stream = weather_stream("weather", Some(&out), "");
        let source = MemorySource::new("weather");

        source.push(reading("2018-10-01T14:05:00", "12345", 75));
        source.push(reading("2018-10-01T14:10:00", "12345", 76));
        let handle = builder(stream.clone(), &checkpoints)
            .with_source(Arc::new(source.clone()))
            .start()
            .unwrap();
        wait_for(&handle, 2).await;
        handle.stop().await.unwrap();

        source.push(reading("2018-10-01T14:20:00", "12345", 77));
        let handle = builder(stream, &checkpoints)
            .with_source(Arc::new(source.clone()))
            .start()
            .unwrap();
        assert!(handle.committed_offset() <= Offset(2));
        wait_for(&handle, 3).await;

        // Only the record after the committed offset is processed again.
        assert_eq!(handle.view().unwrap().row_count(), 1);
        assert_eq!(handle.metrics().records_polled(), 1);
        handle.stop().await.unwrap();

        let stream_dir = checkpoints.join("weather");
        assert_eq!(entry_counts(&stream_dir, "StreamStopped"), 2);
        let state = RecoveryState::from_entries(read_entries(&stream_dir).unwrap()).unwrap();
        assert!(state.clean_shutdown);
        assert_eq!(state.next_offset(), Offset(3));
        assert_eq!(state.next_batch_id(), 2);
    }
}

mod lifecycle {
    use super::*;
    use tokio::sync::Notify;

    /// Sink that blocks inside `write` until released.
    struct GatedSink {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Sink for GatedSink {
        fn id(&self) -> &str {
            "gated"
        }

        fn is_durable(&self) -> bool {
            false
        }

        async fn write(&self, batch: &Batch) -> Result<SinkReceipt, SinkError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(SinkReceipt::rows(batch.len() as u64))
        }
    }

    /// Sink that fails its first `failures` writes.
    struct FlakySink {
        failures: AtomicU32,
        writes: AtomicU32,
        aborts: AtomicU32,
    }

    #[async_trait]
    impl Sink for FlakySink {
        fn id(&self) -> &str {
            "flaky"
        }

        fn is_durable(&self) -> bool {
            false
        }

        async fn write(&self, batch: &Batch) -> Result<SinkReceipt, SinkError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SinkError::Write {
                    sink: "flaky".into(),
                    message: "connection reset".into(),
                });
            }
            Ok(SinkReceipt::rows(batch.len() as u64))
        }

        async fn abort(&self, _batch_id: u64) -> Result<(), SinkError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_batch() {
        let temp = TempDir::new().unwrap();
        let gate = Arc::new(GatedSink {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let handle = builder(weather_stream("weather", None, ""), temp.path())
            .with_sink(gate.clone())
            .start()
            .unwrap();
        let source = handle.memory_source().unwrap();
        source.push(reading("2018-10-01T14:05:00", "12345", 75));

        tokio::time::timeout(WAIT, gate.entered.notified()).await.unwrap();
        assert_eq!(handle.state(), StreamState::Sinking);

        handle.request_stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), StreamState::Sinking);

        gate.release.notify_one();
        tokio::time::timeout(WAIT, handle.await_termination())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.state(), StreamState::Stopped);
        assert_eq!(handle.committed_offset(), Offset(1));
        assert_eq!(handle.view().unwrap().row_count(), 1);

        // Nothing after the stop is picked up.
        source.push(reading("2018-10-01T14:06:00", "12345", 76));
        assert_eq!(handle.committed_offset(), Offset(1));
    }

    #[tokio::test]
    async fn test_idle_stream_stops_promptly() {
        let temp = TempDir::new().unwrap();
        let stream = weather_stream("weather", None, "");
        let handle = StreamBuilder::new(stream)
            .with_scheduler_config(SchedulerConfig {
                poll_interval_ms: 60_000,
                ..fast_scheduler()
            })
            .with_checkpoint_config(checkpoint_config(temp.path()))
            .start()
            .unwrap();

        wait_for_state(&handle, |s| *s == StreamState::Idle).await;
        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.state(), StreamState::Stopped);

        // A second stop is a no-op.
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_sink_write_is_retried() {
        let temp = TempDir::new().unwrap();
        let flaky = Arc::new(FlakySink {
            failures: AtomicU32::new(2),
            writes: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
        });
        let handle = builder(weather_stream("weather", None, ""), temp.path())
            .with_sink(flaky.clone())
            .start()
            .unwrap();
        let source = handle.memory_source().unwrap();
        source.push(reading("2018-10-01T14:05:00", "12345", 75));
        wait_for(&handle, 1).await;

        assert_eq!(flaky.writes.load(Ordering::SeqCst), 3);
        assert_eq!(flaky.aborts.load(Ordering::SeqCst), 2);
        assert_eq!(handle.metrics().sink_retries(), 2);
        assert_eq!(handle.metrics().sink_failures(), 2);
        // The view accepted the batch on the first attempt and is not written twice.
        assert_eq!(handle.view().unwrap().row_count(), 1);
        assert_eq!(handle.progress().batches_committed, 1);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sink_failure_after_retries_fails_stream() {
        let temp = TempDir::new().unwrap();
        let flaky = Arc::new(FlakySink {
            failures: AtomicU32::new(u32::MAX),
            writes: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
        });
        let handle = builder(weather_stream("weather", None, ""), temp.path())
            .with_sink(flaky.clone())
            .start()
            .unwrap();
        let source = handle.memory_source().unwrap();
        source.push(reading("2018-10-01T14:05:00", "12345", 75));

        let err = tokio::time::timeout(WAIT, handle.wait_for_offset(Offset(1)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, rill_core::Error::StreamFailed(_)));
        assert!(matches!(handle.state(), StreamState::Failed(_)));
        // One initial write plus the default three retries, each aborted.
        assert_eq!(flaky.writes.load(Ordering::SeqCst), 4);
        assert_eq!(flaky.aborts.load(Ordering::SeqCst), 4);
        assert_eq!(handle.committed_offset(), Offset::ZERO);

        let err = handle.await_termination().await.unwrap_err();
        assert!(matches!(err, rill_core::Error::Sink(SinkError::Write { .. })));
    }

    #[tokio::test]
    async fn test_view_capacity_fails_without_retry() {
        let temp = TempDir::new().unwrap();
        let stream = weather_stream("weather", None, "max_rows = 1\n");
        let handle = builder(stream, temp.path()).start().unwrap();
        let source = handle.memory_source().unwrap();
        source.push_all([
            reading("2018-10-01T14:05:00", "12345", 75),
            reading("2018-10-01T14:06:00", "12345", 76),
        ]);

        let state = wait_for_state(&handle, |s| s.is_terminal()).await;
        match state {
            StreamState::Failed(message) => assert!(message.contains("Capacity exceeded")),
            other => panic!("unexpected state {:?}", other),
        }
        assert!(handle.await_termination().await.is_err());
        assert_eq!(handle.metrics().sink_retries(), 0);
        assert_eq!(handle.health().report().running_streams.len(), 0);
    }

    #[tokio::test]
    async fn test_transient_poll_failures_are_retried() {
        let temp = TempDir::new().unwrap();
        let source = MemorySource::new("weather");
        source.inject_failures(3);
        source.push(reading("2018-10-01T14:05:00", "12345", 75));

        let handle = builder(weather_stream("weather", None, ""), temp.path())
            .with_source(Arc::new(source.clone()))
            .start()
            .unwrap();
        wait_for(&handle, 1).await;

        assert_eq!(handle.metrics().poll_errors(), 3);
        assert_eq!(handle.view().unwrap().row_count(), 1);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_source_fails_stream() {
        let temp = TempDir::new().unwrap();
        let handle = builder(weather_stream("weather", None, ""), temp.path())
            .start()
            .unwrap();
        handle.memory_source().unwrap().close();

        let err = tokio::time::timeout(WAIT, handle.await_termination())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, rill_core::Error::Source(_)));
        assert!(handle.state().is_terminal());
    }
}

mod multi_stream {
    use super::*;
    use rill_core::health::HealthCheck;
    use rill_core::{start_all, ViewCatalog};

    #[tokio::test]
    async fn test_streams_run_independently() {
        let temp = TempDir::new().unwrap();
        let mut alerts = weather_stream("alerts", None, "");
        alerts.sinks.view.as_mut().unwrap().name = Some("alert_view".into());
        let config = Config {
            scheduler: fast_scheduler(),
            checkpoint: checkpoint_config(temp.path()),
            monitoring: Default::default(),
            streams: vec![weather_stream("weather", None, ""), alerts],
        };
        config.validate().unwrap();

        let catalog = ViewCatalog::new();
        let health = Arc::new(HealthCheck::new());
        let handles = start_all(&config, &catalog, health.clone()).unwrap();
        assert_eq!(handles.len(), 2);

        handles[0]
            .memory_source()
            .unwrap()
            .push(reading("2018-10-01T14:05:00", "12345", 75));
        for i in 0..3 {
            handles[1]
                .memory_source()
                .unwrap()
                .push(reading("2018-10-01T14:05:00", "22334", 60 + i));
        }
        wait_for(&handles[0], 1).await;
        wait_for(&handles[1], 3).await;

        let mut names = catalog.names();
        names.sort();
        assert_eq!(names, vec!["alert_view", "weather"]);
        assert_eq!(catalog.get("weather").unwrap().row_count(), 1);
        assert_eq!(catalog.get("alert_view").unwrap().row_count(), 3);

        let report = health.report();
        assert_eq!(report.running_streams, vec!["alerts", "weather"]);
        assert!(report.components.contains_key("weather:source"));
        assert!(report.components.contains_key("alerts:checkpoint"));

        // Stopping one stream leaves the other running.
        handles[0].stop().await.unwrap();
        assert!(handles[1].is_active());
        handles[1]
            .memory_source()
            .unwrap()
            .push(reading("2018-10-01T14:05:00", "22334", 90));
        wait_for(&handles[1], 4).await;
        handles[1].stop().await.unwrap();

        assert!(temp.path().join("weather").is_dir());
        assert!(temp.path().join("alerts").is_dir());
    }

    #[tokio::test]
    async fn test_duplicate_view_registration_is_rejected() {
        let temp = TempDir::new().unwrap();
        let catalog = rill_core::ViewCatalog::new();
        let first = builder(weather_stream("weather", None, ""), temp.path())
            .with_catalog(catalog.clone())
            .start()
            .unwrap();

        let second = builder(weather_stream("weather", None, ""), &temp.path().join("other"))
            .with_catalog(catalog.clone())
            .start();
        assert!(second.is_err());

        first.stop().await.unwrap();
    }
}
