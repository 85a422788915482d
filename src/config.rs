//! Layered configuration: a TOML file under `BINLOG_CAPTURE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::event::Position;
use crate::flush::FlushSettings;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub task: TaskSection,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskSection {
    /// Stable task identifier. Without one a fresh id is generated per run,
    /// and a new process cannot find the previous run's checkpoint.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_binlog_file")]
    pub binlog_file: String,
    #[serde(default)]
    pub binlog_position: u64,
    #[serde(default = "default_true")]
    pub use_stored_position: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_row_bucket")]
    pub row_bucket: String,
    #[serde(default = "default_position_bucket")]
    pub position_bucket: String,
    #[serde(default = "default_task_bucket")]
    pub task_bucket: String,
    #[serde(default = "default_position_key")]
    pub position_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// `0` disables the periodic flush/checkpoint tick.
    #[serde(default = "default_flush_interval_us")]
    pub flush_interval_us: u64,
    #[serde(default = "default_true")]
    pub flush_on_shutdown: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("BINLOG_CAPTURE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.queue_capacity == 0 {
            return Err(Error::InvalidConfig("pipeline.queue_capacity must be > 0".into()));
        }
        if self.pipeline.batch_size == 0 {
            return Err(Error::InvalidConfig("pipeline.batch_size must be > 0".into()));
        }
        if self.source.binlog_file.is_empty() {
            return Err(Error::InvalidConfig("source.binlog_file must not be empty".into()));
        }
        for (name, value) in [
            ("storage.row_bucket", &self.storage.row_bucket),
            ("storage.position_bucket", &self.storage.position_bucket),
            ("storage.task_bucket", &self.storage.task_bucket),
            ("storage.position_key", &self.storage.position_key),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidConfig(format!("{} must not be empty", name)));
            }
        }
        if matches!(&self.task.id, Some(id) if id.is_empty()) {
            return Err(Error::InvalidConfig("task.id must not be empty when set".into()));
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.file_name)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.source.poll_interval_ms)
    }

    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            task_id: self.task.id.clone(),
            default_position: Position::new(
                self.source.binlog_file.clone(),
                self.source.binlog_position,
            ),
            use_stored_position: self.source.use_stored_position,
            queue_capacity: self.pipeline.queue_capacity,
            flush: FlushSettings {
                batch_size: self.pipeline.batch_size,
                flush_interval: (self.pipeline.flush_interval_us > 0)
                    .then(|| Duration::from_micros(self.pipeline.flush_interval_us)),
                flush_on_shutdown: self.pipeline.flush_on_shutdown,
            },
            row_bucket: self.storage.row_bucket.clone(),
            position_bucket: self.storage.position_bucket.clone(),
            task_bucket: self.storage.task_bucket.clone(),
            position_key: self.storage.position_key.clone(),
        }
    }
}

/// Everything a [`Task`](crate::Task) needs, passed explicitly at
/// construction.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub task_id: Option<String>,
    /// Where to start when no stored checkpoint is used.
    pub default_position: Position,
    pub use_stored_position: bool,
    pub queue_capacity: usize,
    pub flush: FlushSettings,
    /// Base names; the task prefixes the row and position buckets with its id.
    pub row_bucket: String,
    pub position_bucket: String,
    /// Shared across tasks, keyed by task id.
    pub task_bucket: String,
    pub position_key: String,
}

impl TaskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be > 0".into()));
        }
        if self.flush.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".into()));
        }
        if matches!(&self.task_id, Some(id) if id.is_empty()) {
            return Err(Error::InvalidConfig("task_id must not be empty when set".into()));
        }
        for (name, value) in [
            ("row_bucket", &self.row_bucket),
            ("position_bucket", &self.position_bucket),
            ("task_bucket", &self.task_bucket),
            ("position_key", &self.position_key),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidConfig(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Config::default().task_config()
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            binlog_file: default_binlog_file(),
            binlog_position: 0,
            use_stored_position: true,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            file_name: default_file_name(),
            row_bucket: default_row_bucket(),
            position_bucket: default_position_bucket(),
            task_bucket: default_task_bucket(),
            position_key: default_position_key(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_us: default_flush_interval_us(),
            flush_on_shutdown: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./binlog")
}

fn default_binlog_file() -> String {
    "mysql-bin.000001".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./store/data")
}

fn default_file_name() -> String {
    "data.db".to_string()
}

fn default_row_bucket() -> String {
    "RowRequest".to_string()
}

fn default_position_bucket() -> String {
    "Position".to_string()
}

fn default_task_bucket() -> String {
    "Task".to_string()
}

fn default_position_key() -> String {
    "bolt_position_key".to_string()
}

fn default_queue_capacity() -> usize {
    crate::queue::DEFAULT_QUEUE_CAPACITY
}

fn default_batch_size() -> usize {
    20
}

fn default_flush_interval_us() -> u64 {
    100
}
