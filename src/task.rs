//! Task lifecycle: `created → running → stopped`, with restart from stopped.
//!
//! A task wires a log reader to its own event queue and flush loop, and owns
//! the cancellation token of the current run. Its buckets are prefixed with
//! the task id so several tasks can share one store without interfering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, CheckpointTracker, ResumePoint};
use crate::config::TaskConfig;
use crate::event::Position;
use crate::flush::{FlushLoop, FlushStats};
use crate::queue;
use crate::source::LogReader;
use crate::storage::DurableBuffer;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Running => write!(f, "running"),
            TaskState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Informational record kept in the shared task bucket, one per task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub state: TaskState,
    pub resume_position: Option<Position>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn load(
        buffer: &dyn DurableBuffer,
        task_bucket: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>> {
        match buffer.get_keyed(task_bucket, task_id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }
}

struct Run {
    cancel: CancellationToken,
    flush: JoinHandle<Result<FlushStats>>,
}

pub struct Task {
    task_id: String,
    config: TaskConfig,
    state: TaskState,
    reader: Box<dyn LogReader>,
    buffer: Arc<dyn DurableBuffer>,
    checkpoints: CheckpointStore,
    row_bucket: String,
    root: CancellationToken,
    run: Option<Run>,
}

impl Task {
    /// Creates the task and its buckets.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the configuration is invalid, the buckets cannot be
    /// created or the task record cannot be written.
    pub fn new(
        config: TaskConfig,
        reader: Box<dyn LogReader>,
        buffer: Arc<dyn DurableBuffer>,
    ) -> Result<Self> {
        config.validate()?;
        let task_id = config
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let row_bucket = format!("{}_{}", task_id, config.row_bucket);
        let position_bucket = format!("{}_{}", task_id, config.position_bucket);

        buffer.create_buckets_if_absent(&[
            row_bucket.as_str(),
            position_bucket.as_str(),
            config.task_bucket.as_str(),
        ])?;

        let checkpoints =
            CheckpointStore::new(buffer.clone(), position_bucket, config.position_key.clone());

        let task = Self {
            task_id,
            config,
            state: TaskState::Created,
            reader,
            buffer,
            checkpoints,
            row_bucket,
            root: CancellationToken::new(),
            run: None,
        };
        task.write_record(None)?;

        info!(task_id = %task.task_id, row_bucket = %task.row_bucket, "Task created");
        Ok(task)
    }

    pub fn id(&self) -> &str {
        &self.task_id
    }

    /// Bucket holding this task's buffered row events.
    pub fn row_bucket(&self) -> &str {
        &self.row_bucket
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Current lifecycle state.
    ///
    /// A running task whose run token was cancelled or whose flush loop has
    /// exited on its own reports `Stopped`.
    pub fn state(&self) -> TaskState {
        match (&self.state, &self.run) {
            (TaskState::Running, Some(run))
                if run.cancel.is_cancelled() || run.flush.is_finished() =>
            {
                TaskState::Stopped
            }
            (state, _) => *state,
        }
    }

    /// Token of the current run. It is cancelled by [`stop`](Self::stop), by
    /// a fatal flush failure and by a reader that fails mid-stream.
    pub fn cancellation(&self) -> Option<CancellationToken> {
        self.run.as_ref().map(|run| run.cancel.clone())
    }

    /// Starts streaming from the stored checkpoint (when configured to use
    /// it) or from the configured default position.
    pub async fn start(&mut self) -> Result<()> {
        match self.state() {
            TaskState::Created => {}
            TaskState::Running => return Err(self.already_running()),
            TaskState::Stopped => return Err(self.invalid_transition("start")),
        }

        let resume = self
            .checkpoints
            .resolve_resume(&self.config.default_position, self.config.use_stored_position)?;
        self.launch(resume).await
    }

    /// Starts a stopped task again from whatever is persisted now.
    pub async fn restart(&mut self) -> Result<()> {
        match self.state() {
            TaskState::Stopped => {}
            TaskState::Running => return Err(self.already_running()),
            TaskState::Created => return Err(self.invalid_transition("restart")),
        }

        // reap a run that ended on its own
        if self.run.is_some() {
            self.stop().await;
        }

        let resume = self
            .checkpoints
            .resolve_resume(&self.config.default_position, true)?;
        self.launch(resume).await
    }

    /// Cancels the flush loop, closes the reader and waits for both.
    ///
    /// No writes happen after this returns. Calling it on a task that is not
    /// running does nothing.
    pub async fn stop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };

        info!(task_id = %self.task_id, "Stopping task");
        run.cancel.cancel();
        self.reader.close().await;

        match run.flush.await {
            Ok(Ok(stats)) => info!(
                task_id = %self.task_id,
                events_flushed = stats.events_flushed,
                flushes = stats.flushes,
                checkpoints = stats.checkpoints,
                "Task stopped"
            ),
            Ok(Err(e)) => {
                warn!(task_id = %self.task_id, error = %e, "Task stopped after flush failure")
            }
            Err(e) => error!(task_id = %self.task_id, error = %e, "Flush loop panicked"),
        }

        self.state = TaskState::Stopped;
        if let Err(e) = self.write_record(None) {
            warn!(task_id = %self.task_id, error = %e, "Failed to record task state");
        }
    }

    async fn launch(&mut self, resume: ResumePoint) -> Result<()> {
        if let Err(e) = self.buffer.create_buckets_if_absent(&[
            self.row_bucket.as_str(),
            self.checkpoints.bucket(),
            self.config.task_bucket.as_str(),
        ]) {
            error!(task_id = %self.task_id, error = %e, "Failed to create task buckets");
            self.state = TaskState::Stopped;
            return Err(e);
        }

        let (producer, receiver) =
            queue::channel(self.task_id.clone(), self.config.queue_capacity);
        let cancel = self.root.child_token();
        let position = resume.position.clone();

        let flush = FlushLoop::new(
            self.task_id.clone(),
            receiver,
            self.buffer.clone(),
            self.row_bucket.clone(),
            CheckpointTracker::new(self.checkpoints.clone(), resume),
            self.config.flush.clone(),
            cancel.clone(),
        );
        self.run = Some(Run {
            cancel: cancel.clone(),
            flush: tokio::spawn(flush.run()),
        });
        self.state = TaskState::Running;

        self.reader.set_event_handler(Arc::new(producer));

        info!(task_id = %self.task_id, position = %position, "Task starting");
        if let Err(e) = self.reader.start_from(position.clone(), cancel).await {
            error!(
                task_id = %self.task_id,
                position = %position,
                error = %e,
                "Log reader failed to start"
            );
            self.stop().await;
            return Err(e);
        }

        if let Err(e) = self.write_record(Some(position)) {
            warn!(task_id = %self.task_id, error = %e, "Failed to record task state");
        }
        Ok(())
    }

    fn write_record(&self, resume_position: Option<Position>) -> Result<()> {
        let record = TaskRecord {
            task_id: self.task_id.clone(),
            state: self.state,
            resume_position,
            updated_at: Utc::now(),
        };
        let data = serde_json::to_vec(&record)?;
        self.buffer
            .put_keyed(&self.config.task_bucket, self.task_id.as_bytes(), &data)
    }

    fn already_running(&self) -> Error {
        Error::AlreadyRunning {
            task_id: self.task_id.clone(),
        }
    }

    fn invalid_transition(&self, operation: &'static str) -> Error {
        Error::InvalidTransition {
            task_id: self.task_id.clone(),
            state: self.state().to_string(),
            operation,
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
