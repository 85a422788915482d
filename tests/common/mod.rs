#![allow(dead_code)]

use binlog_capture::{Config, DurableBuffer, LogEntry, RowChangeEvent};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("binlog_capture=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Configuration rooted in `root`, with short tick and poll intervals so
/// tests settle quickly.
pub fn test_config(root: &Path, task_id: &str) -> Config {
    let mut config = Config::default();
    config.task.id = Some(task_id.to_string());
    config.source.log_dir = root.join("binlog");
    config.source.poll_interval_ms = 10;
    config.storage.data_dir = root.join("store");
    config.pipeline.flush_interval_us = 1_000;
    config
}

pub fn row(id: i64) -> RowChangeEvent {
    RowChangeEvent::insert(
        "shop",
        "orders",
        vec![json!(id), json!(format!("order-{}", id))],
        1_700_000_000,
    )
}

/// Writes segment files the way the file log reader expects them.
pub struct LogDir {
    dir: PathBuf,
}

impl LogDir {
    pub fn create(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    /// Appends an entry and returns the segment length afterwards, which is
    /// the position just past the entry.
    pub fn append(&self, segment: &str, entry: &LogEntry) -> u64 {
        let path = self.dir.join(segment);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let mut line = serde_json::to_vec(entry).unwrap();
        line.push(b'\n');
        file.write_all(&line).unwrap();
        file.sync_all().unwrap();
        std::fs::metadata(&path).unwrap().len()
    }

    pub fn append_rows(&self, segment: &str, ids: impl IntoIterator<Item = i64>) -> u64 {
        let mut end = self.len(segment);
        for id in ids {
            end = self.append(segment, &LogEntry::Row(row(id)));
        }
        end
    }

    /// Appends raw bytes, newline or not.
    pub fn append_raw(&self, segment: &str, bytes: &[u8]) -> u64 {
        let path = self.dir.join(segment);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(bytes).unwrap();
        file.sync_all().unwrap();
        std::fs::metadata(&path).unwrap().len()
    }

    /// Creates an empty segment.
    pub fn touch(&self, segment: &str) {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(segment))
            .unwrap();
    }

    pub fn len(&self, segment: &str) -> u64 {
        std::fs::metadata(self.dir.join(segment))
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// Ids of the buffered rows, in sequence order.
pub fn buffered_ids(buffer: &dyn DurableBuffer, bucket: &str) -> Vec<i64> {
    buffer
        .scan(bucket, usize::MAX)
        .unwrap()
        .into_iter()
        .map(|(_, value)| {
            let event: RowChangeEvent = serde_json::from_slice(&value).unwrap();
            event.after.unwrap()[0].as_i64().unwrap()
        })
        .collect()
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
