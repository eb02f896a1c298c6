//! Month-partitioned append-only JSONL writer.
//!
//! One writer owns one stream (SFT or DPO). Records land in
//! `{prefix}_YYYYMM.jsonl` under the configured directory; the partition
//! rolls over when the UTC month changes. Each record is written as a
//! single complete line, so readers may tail the file safely.
//!
//! Exclusivity: an advisory exclusive lock is held on each open partition
//! file. A second writer on the same partition fails fast instead of
//! interleaving lines.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::SinkError;

/// Attempts per record before surfacing a write failure.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Delay between write attempts.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Partition prefix for the SFT stream.
pub const SFT_PREFIX: &str = "training_data";

/// Partition prefix for the DPO stream.
pub const DPO_PREFIX: &str = "dpo_data";

/// When appended records are flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every record. Slowest, loses nothing.
    Every,
    /// fsync after every n records.
    Batch(usize),
    /// Never fsync explicitly; leave it to the OS.
    Off,
}

impl SyncPolicy {
    /// Parses `"every"`, `"off"`, `"batch"` (default 64), or `"batch:N"`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "every" => Some(SyncPolicy::Every),
            "off" => Some(SyncPolicy::Off),
            "batch" => Some(SyncPolicy::Batch(64)),
            other => {
                let n = other.strip_prefix("batch:")?.parse().ok()?;
                if n == 0 {
                    None
                } else {
                    Some(SyncPolicy::Batch(n))
                }
            }
        }
    }
}

/// Returns the partition file name for a prefix at a point in time.
pub fn partition_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.jsonl", prefix, at.format("%Y%m"))
}

struct OpenPartition {
    month: String,
    file: File,
    path: PathBuf,
    unsynced: usize,
}

/// Append-only JSONL sink for one stream.
pub struct JsonlSink {
    dir: PathBuf,
    prefix: String,
    sync: SyncPolicy,
    state: Mutex<Option<OpenPartition>>,
}

impl JsonlSink {
    /// Creates a sink writing `{prefix}_YYYYMM.jsonl` files under `dir`.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, sync: SyncPolicy) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            sync,
            state: Mutex::new(None),
        }
    }

    /// Sink for the SFT stream.
    pub fn training(dir: impl Into<PathBuf>, sync: SyncPolicy) -> Self {
        Self::new(dir, SFT_PREFIX, sync)
    }

    /// Sink for the DPO stream.
    pub fn dpo(dir: impl Into<PathBuf>, sync: SyncPolicy) -> Self {
        Self::new(dir, DPO_PREFIX, sync)
    }

    /// Appends one record as a complete JSON line.
    ///
    /// Retries transient I/O failures with a short delay, reopening the
    /// partition between attempts. On exhaustion the error propagates so
    /// the caller stalls instead of dropping the record.
    pub async fn append<T: Serialize>(&self, record: &T) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut state = self.state.lock().await;
        let mut last_error: Option<std::io::Error> = None;

        for attempt in 0..MAX_WRITE_ATTEMPTS {
            if attempt > 0 {
                // A failed write may leave the handle in a bad state; drop
                // and reopen before trying again.
                *state = None;
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }

            match self.write_line(&mut state, &line) {
                Ok(()) => return Ok(()),
                Err(SinkError::Io(e)) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        prefix = %self.prefix,
                        "Sink write failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SinkError::RetriesExhausted {
            attempts: MAX_WRITE_ATTEMPTS,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Flushes any unsynced records to stable storage.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if let Some(partition) = state.as_mut() {
            if partition.unsynced > 0 {
                partition.file.sync_data()?;
                partition.unsynced = 0;
            }
        }
        Ok(())
    }

    /// Scans the sink directory and reports per-partition record counts.
    pub fn stats(&self) -> Result<SinkStats, SinkError> {
        let mut files = Vec::new();
        let mut total = 0;

        if self.dir.is_dir() {
            for entry in std::fs::read_dir(&self.dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&format!("{}_", self.prefix)) && name.ends_with(".jsonl") {
                    let records = count_lines(&entry.path())?;
                    total += records;
                    files.push(PartitionStats { name, records });
                }
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(SinkStats {
            dir: self.dir.clone(),
            files,
            total_records: total,
        })
    }

    fn write_line(
        &self,
        state: &mut Option<OpenPartition>,
        line: &str,
    ) -> Result<(), SinkError> {
        let month = Utc::now().format("%Y%m").to_string();

        let needs_open = match state.as_ref() {
            Some(partition) => partition.month != month,
            None => true,
        };

        if needs_open {
            // Sync the outgoing partition before rolling over.
            if let Some(old) = state.take() {
                if old.unsynced > 0 {
                    let _ = old.file.sync_data();
                }
            }
            *state = Some(self.open_partition(&month)?);
        }

        let partition = state
            .as_mut()
            .ok_or_else(|| SinkError::Io(std::io::Error::other("partition not open")))?;

        // One write call per record keeps the appended line contiguous.
        partition.file.write_all(line.as_bytes())?;

        match self.sync {
            SyncPolicy::Every => partition.file.sync_data()?,
            SyncPolicy::Batch(n) => {
                partition.unsynced += 1;
                if partition.unsynced >= n {
                    partition.file.sync_data()?;
                    partition.unsynced = 0;
                }
            }
            SyncPolicy::Off => {}
        }

        Ok(())
    }

    fn open_partition(&self, month: &str) -> Result<OpenPartition, SinkError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}_{}.jsonl", self.prefix, month));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        file.try_lock_exclusive()
            .map_err(|e| SinkError::LockFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(path = %path.display(), "Opened sink partition");

        Ok(OpenPartition {
            month: month.to_string(),
            file,
            path,
            unsynced: 0,
        })
    }

    /// Path of the currently open partition, if any. Test hook.
    pub async fn current_path(&self) -> Option<PathBuf> {
        self.state.lock().await.as_ref().map(|p| p.path.clone())
    }
}

/// Statistics for one partition file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartitionStats {
    pub name: String,
    pub records: usize,
}

/// Statistics for one sink directory.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SinkStats {
    pub dir: PathBuf,
    pub files: Vec<PartitionStats>,
    pub total_records: usize,
}

fn count_lines(path: &Path) -> Result<usize, SinkError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content.lines().filter(|l| !l.trim().is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_sync_policy_parse() {
        assert_eq!(SyncPolicy::parse("every"), Some(SyncPolicy::Every));
        assert_eq!(SyncPolicy::parse("OFF"), Some(SyncPolicy::Off));
        assert_eq!(SyncPolicy::parse("batch"), Some(SyncPolicy::Batch(64)));
        assert_eq!(SyncPolicy::parse("batch:10"), Some(SyncPolicy::Batch(10)));
        assert_eq!(SyncPolicy::parse("batch:0"), None);
        assert_eq!(SyncPolicy::parse("sometimes"), None);
    }

    #[test]
    fn test_partition_name() {
        let at = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        assert_eq!(partition_name("training_data", at), "training_data_202403.jsonl");
        assert_eq!(partition_name("dpo_data", at), "dpo_data_202403.jsonl");
    }

    #[tokio::test]
    async fn test_append_writes_complete_lines() {
        let dir = TempDir::new().expect("tempdir");
        let sink = JsonlSink::training(dir.path(), SyncPolicy::Every);

        sink.append(&json!({"a": 1})).await.expect("append");
        sink.append(&json!({"b": 2})).await.expect("append");

        let path = sink.current_path().await.expect("partition open");
        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        // Every non-empty line parses as a standalone JSON object.
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            assert!(value.is_object());
        }
        assert!(content.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_partition_uses_current_month() {
        let dir = TempDir::new().expect("tempdir");
        let sink = JsonlSink::dpo(dir.path(), SyncPolicy::Off);
        sink.append(&json!({"x": true})).await.expect("append");

        let expected = partition_name(DPO_PREFIX, Utc::now());
        let path = sink.current_path().await.expect("partition open");
        assert_eq!(path.file_name().unwrap().to_string_lossy(), expected);
    }

    #[tokio::test]
    async fn test_second_writer_is_locked_out() {
        let dir = TempDir::new().expect("tempdir");
        let first = JsonlSink::training(dir.path(), SyncPolicy::Every);
        first.append(&json!({"n": 1})).await.expect("append");

        let second = JsonlSink::training(dir.path(), SyncPolicy::Every);
        let err = second
            .append(&json!({"n": 2}))
            .await
            .expect_err("lock should be held");
        assert!(matches!(err, SinkError::LockFailed { .. }));
    }

    #[tokio::test]
    async fn test_batch_policy_counts_unsynced() {
        let dir = TempDir::new().expect("tempdir");
        let sink = JsonlSink::training(dir.path(), SyncPolicy::Batch(2));

        sink.append(&json!({"n": 1})).await.expect("append");
        sink.append(&json!({"n": 2})).await.expect("append");
        sink.append(&json!({"n": 3})).await.expect("append");
        sink.flush().await.expect("flush");

        let stats = sink.stats().expect("stats");
        assert_eq!(stats.total_records, 3);
    }

    #[tokio::test]
    async fn test_stats_counts_partitions() {
        let dir = TempDir::new().expect("tempdir");

        // A stale partition from an earlier month alongside live writes.
        std::fs::write(
            dir.path().join("training_data_202001.jsonl"),
            "{\"old\": 1}\n{\"old\": 2}\n",
        )
        .expect("seed old partition");

        let sink = JsonlSink::training(dir.path(), SyncPolicy::Every);
        sink.append(&json!({"new": 1})).await.expect("append");

        let stats = sink.stats().expect("stats");
        assert_eq!(stats.files.len(), 2);
        assert_eq!(stats.total_records, 3);
    }
}
