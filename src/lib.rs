pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod flush;
pub mod queue;
pub mod source;
pub mod storage;
pub mod task;

pub use checkpoint::{CheckpointStore, CheckpointTracker, ResumePoint};
pub use config::{Config, TaskConfig};
pub use error::{Error, Result};
pub use event::{Position, PositionUpdate, RowAction, RowChangeEvent};
pub use flush::{FlushLoop, FlushSettings, FlushStats};
pub use source::{EventHandler, FileLogReader, LogEntry, LogReader};
pub use storage::{DurableBuffer, MemoryBuffer, RedbBuffer};
pub use task::{Task, TaskRecord, TaskState};
