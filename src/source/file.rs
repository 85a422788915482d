//! A log reader over a directory of segment files.
//!
//! Segment file names sort in log order (`mysql-bin.000001`,
//! `mysql-bin.000002`, ...). Every line of a segment is one JSON
//! [`LogEntry`]; positions are byte offsets just past a line. When a segment
//! is exhausted and a later one exists the reader rotates to it, otherwise it
//! keeps polling the current segment for appended lines.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventHandler, LogReader};
use crate::event::{Position, RowChangeEvent};
use crate::{Error, Result};

/// One line of a segment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Row(RowChangeEvent),
    SchemaChange { description: String },
}

pub struct FileLogReader {
    log_dir: PathBuf,
    poll_interval: Duration,
    handler: Option<Arc<dyn EventHandler>>,
    cancel: Option<CancellationToken>,
    worker: Option<JoinHandle<()>>,
}

impl FileLogReader {
    pub fn new(log_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            log_dir: log_dir.into(),
            poll_interval,
            handler: None,
            cancel: None,
            worker: None,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[async_trait]
impl LogReader for FileLogReader {
    fn set_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handler = Some(handler);
    }

    async fn start_from(&mut self, position: Position, run: CancellationToken) -> Result<()> {
        if self.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return Err(Error::Replication {
                message: "reader is already streaming".to_string(),
            });
        }
        let handler = self.handler.clone().ok_or_else(|| Error::Replication {
            message: "no event handler installed".to_string(),
        })?;

        if !fs::try_exists(&self.log_dir).await.unwrap_or(false) {
            return Err(Error::Connection(format!(
                "log directory {} does not exist",
                self.log_dir.display()
            )));
        }
        let segment_path = self.log_dir.join(&position.segment);
        let segment_len = match fs::metadata(&segment_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(Error::Connection(format!(
                    "cannot open segment {}: {}",
                    segment_path.display(),
                    e
                )))
            }
        };
        if position.offset > segment_len {
            return Err(Error::Replication {
                message: format!(
                    "position {} is past the end of the segment ({} bytes)",
                    position, segment_len
                ),
            });
        }

        let cursor =
            Cursor::open(&self.log_dir, position.segment.clone(), position.offset).await?;

        info!(
            log_dir = %self.log_dir.display(),
            position = %position,
            "Starting log reader"
        );

        let cancel = run.child_token();
        let stream = SegmentStream {
            log_dir: self.log_dir.clone(),
            poll_interval: self.poll_interval,
            handler,
            cancel: cancel.clone(),
        };
        self.worker = Some(tokio::spawn(async move {
            match stream.run(cursor).await {
                Ok(()) => debug!("Log reader finished"),
                Err(Error::QueueClosed) => {
                    debug!("Event handler closed, log reader stopping");
                    run.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Log reader stopped");
                    run.cancel();
                }
            }
        }));
        self.cancel = Some(cancel);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Log reader task failed");
            }
            info!(log_dir = %self.log_dir.display(), "Log reader closed");
        }
    }
}

impl Drop for FileLogReader {
    fn drop(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

/// An open segment and how far into it lines have been delivered.
struct Cursor {
    segment: String,
    offset: u64,
    reader: BufReader<fs::File>,
    /// Bytes of a line whose newline has not been written yet.
    partial: Vec<u8>,
}

impl Cursor {
    async fn open(log_dir: &Path, segment: String, offset: u64) -> Result<Self> {
        let mut file = fs::File::open(log_dir.join(&segment)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Self {
            segment,
            offset,
            reader: BufReader::new(file),
            partial: Vec::new(),
        })
    }
}

struct SegmentStream {
    log_dir: PathBuf,
    poll_interval: Duration,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
}

impl SegmentStream {
    async fn run(self, mut cursor: Cursor) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            if self.replay(&mut cursor).await? > 0 {
                continue;
            }

            if let Some(next) = next_segment(&self.log_dir, &cursor.segment).await? {
                // a later segment exists, so this one is complete
                self.replay(&mut cursor).await?;
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                self.finish(&mut cursor).await?;

                self.handler.on_rotate(0, &next).await?;
                cursor = Cursor::open(&self.log_dir, next, 0).await?;
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Delivers complete lines until the end of the data written so far and
    /// returns how many were read. A trailing partial line is kept in the
    /// cursor and completed by a later call.
    async fn replay(&self, cursor: &mut Cursor) -> Result<usize> {
        let mut lines = 0;
        while !self.cancel.is_cancelled() {
            let read = cursor.reader.read_until(b'\n', &mut cursor.partial).await?;
            if read == 0 || cursor.partial.last() != Some(&b'\n') {
                break;
            }

            let mut line = std::mem::take(&mut cursor.partial);
            line.pop();
            self.deliver(cursor, &line, line.len() as u64 + 1).await?;
            lines += 1;
        }
        Ok(lines)
    }

    /// Delivers a last line that was never newline-terminated.
    async fn finish(&self, cursor: &mut Cursor) -> Result<()> {
        if cursor.partial.is_empty() {
            return Ok(());
        }

        let line = std::mem::take(&mut cursor.partial);
        warn!(
            segment = %cursor.segment,
            offset = cursor.offset,
            bytes = line.len(),
            "Segment ends without a trailing newline"
        );
        self.deliver(cursor, &line, line.len() as u64).await
    }

    /// Hands one line to the event handler and moves the cursor past its
    /// `len` bytes.
    async fn deliver(&self, cursor: &mut Cursor, line: &[u8], len: u64) -> Result<()> {
        let end = cursor.offset + len;

        if !line.iter().all(u8::is_ascii_whitespace) {
            let entry: LogEntry =
                serde_json::from_slice(line).map_err(|e| Error::InvalidMessage {
                    message: format!("{}:{}: {}", cursor.segment, cursor.offset, e),
                })?;

            let position = Position::new(cursor.segment.as_str(), end);
            match entry {
                LogEntry::Row(event) => {
                    self.handler.on_row_change(event).await?;
                    self.handler.on_position_synced(position, false).await?;
                }
                LogEntry::SchemaChange { description } => {
                    self.handler.on_schema_change(position, &description).await?;
                }
            }
        }

        cursor.offset = end;
        Ok(())
    }
}

/// The first segment that sorts after `current`, if any.
async fn next_segment(log_dir: &Path, current: &str) -> Result<Option<String>> {
    let mut entries = fs::read_dir(log_dir).await?;
    let mut next: Option<String> = None;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with('.') || name.as_str() <= current {
            continue;
        }
        if next.as_ref().map_or(true, |n| name < *n) {
            next = Some(name);
        }
    }

    Ok(next)
}
