//! Checkpoint management for resumable capture.
//!
//! The checkpoint is a single JSON [`Position`] stored under a fixed key in
//! the task's position bucket. It is overwritten in place and is the only
//! source of truth for where a restarted task resumes.
//!
//! # Example
//!
//! ```rust
//! use binlog_capture::checkpoint::CheckpointStore;
//! use binlog_capture::storage::{DurableBuffer, MemoryBuffer};
//! use binlog_capture::Position;
//! use std::sync::Arc;
//!
//! # fn main() -> binlog_capture::Result<()> {
//! let buffer = Arc::new(MemoryBuffer::new());
//! buffer.create_buckets_if_absent(&["task_Position"])?;
//!
//! let store = CheckpointStore::new(buffer, "task_Position", "bolt_position_key");
//! store.save(&Position::new("mysql-bin.000005", 4096))?;
//!
//! let loaded = store.load()?.expect("checkpoint was saved");
//! assert_eq!(loaded.offset, 4096);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::event::{Position, PositionUpdate};
use crate::storage::DurableBuffer;
use crate::Result;

/// Reads and writes the checkpoint record of one task.
#[derive(Clone)]
pub struct CheckpointStore {
    buffer: Arc<dyn DurableBuffer>,
    bucket: String,
    key: String,
}

impl CheckpointStore {
    pub fn new(
        buffer: Arc<dyn DurableBuffer>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            buffer,
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Loads the persisted position.
    ///
    /// Returns `None` when nothing has been stored yet (an empty value counts
    /// as nothing), which typically means this is the task's first run.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the bucket is missing, the store cannot be read, or
    /// the stored value is not a valid `Position`.
    pub fn load(&self) -> Result<Option<Position>> {
        let raw = match self.buffer.get_keyed(&self.bucket, self.key.as_bytes())? {
            Some(raw) if !raw.is_empty() => raw,
            _ => {
                debug!(bucket = %self.bucket, "No checkpoint stored");
                return Ok(None);
            }
        };

        let position: Position = serde_json::from_slice(&raw)?;
        info!(bucket = %self.bucket, position = %position, "Loaded checkpoint");
        Ok(Some(position))
    }

    /// Overwrites the checkpoint record with `position`.
    pub fn save(&self, position: &Position) -> Result<()> {
        let data = serde_json::to_vec(position)?;
        self.buffer
            .put_keyed(&self.bucket, self.key.as_bytes(), &data)?;
        debug!(bucket = %self.bucket, position = %position, "Checkpoint saved");
        Ok(())
    }

    /// Deletes the checkpoint record so the next run starts from the
    /// configured default position.
    pub fn delete(&self) -> Result<()> {
        self.buffer.delete_keyed(&self.bucket, self.key.as_bytes())?;
        info!(bucket = %self.bucket, "Deleted checkpoint");
        Ok(())
    }

    /// Picks the position a run starts from.
    ///
    /// The stored checkpoint wins when `use_stored` is set and one exists;
    /// otherwise `default` is used.
    pub fn resolve_resume(&self, default: &Position, use_stored: bool) -> Result<ResumePoint> {
        if use_stored {
            if let Some(stored) = self.load()? {
                return Ok(ResumePoint {
                    position: stored,
                    from_checkpoint: true,
                });
            }
        }
        Ok(ResumePoint {
            position: default.clone(),
            from_checkpoint: false,
        })
    }
}

/// Where a run starts, and whether that matches what is already persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub position: Position,
    pub from_checkpoint: bool,
}

/// Holds the authoritative in-memory position of a running task and decides
/// when it has to be written out.
///
/// Owned by the flush loop; never shared.
pub struct CheckpointTracker {
    store: CheckpointStore,
    current: Position,
    persisted: Option<Position>,
}

impl CheckpointTracker {
    pub fn new(store: CheckpointStore, resume: ResumePoint) -> Self {
        let persisted = resume.from_checkpoint.then(|| resume.position.clone());
        Self {
            store,
            current: resume.position,
            persisted,
        }
    }

    pub fn current(&self) -> &Position {
        &self.current
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    pub fn is_dirty(&self) -> bool {
        self.persisted.as_ref() != Some(&self.current)
    }

    /// Applies an update from the log reader and reports whether it must be
    /// persisted before anything else happens.
    ///
    /// Offsets never move backwards within a segment: a regressing update is
    /// dropped. A segment change is always treated as forced.
    pub fn advance(&mut self, update: PositionUpdate) -> bool {
        let PositionUpdate { position, force } = update;

        if position.segment == self.current.segment {
            if position.offset < self.current.offset {
                warn!(
                    current = %self.current,
                    update = %position,
                    "Ignoring position update that moves backwards"
                );
                return false;
            }
            self.current = position;
            return force;
        }

        if !force {
            warn!(
                current = %self.current,
                update = %position,
                "Segment changed without a forced update; persisting immediately"
            );
        }
        self.current = position;
        true
    }

    /// Writes the current position unconditionally.
    pub fn persist_now(&mut self) -> Result<()> {
        self.store.save(&self.current)?;
        self.persisted = Some(self.current.clone());
        Ok(())
    }

    /// Writes the current position if it differs from the last one written.
    /// Returns whether a write happened.
    pub fn persist_if_dirty(&mut self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.persist_now()?;
        Ok(true)
    }
}
