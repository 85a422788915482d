//! Error types and result handling for binlog-capture.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use binlog_capture::{Error, Result};
//!
//! fn open_source() -> Result<()> {
//!     Err(Error::Connection("binlog directory missing".to_string()))
//! }
//!
//! match open_source() {
//!     Ok(()) => println!("Streaming"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for binlog-capture operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Embedded store failure (open, transaction, table or commit).
    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    /// A bucket was used before `create_buckets_if_absent` created it.
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// JSON serialization error when encoding events or positions.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from the log directory or the store path.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The log reader could not reach its source.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Replication-specific error raised while streaming.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// Invalid or malformed entry in the replication stream.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// `start` or `restart` was called on a task that is already running.
    #[error("Task {task_id} is already running")]
    AlreadyRunning {
        /// Identifier of the running task
        task_id: String,
    },

    /// A lifecycle operation is not permitted from the current state.
    #[error("Cannot {operation} task {task_id} in state {state}")]
    InvalidTransition {
        /// Identifier of the task
        task_id: String,
        /// State the task was in
        state: String,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// The event queue consumer has gone away.
    #[error("Event queue closed")]
    QueueClosed,
}

impl Error {
    /// Wraps any `redb` error type into [`Error::Storage`].
    pub(crate) fn storage(err: impl Into<redb::Error>) -> Self {
        Error::Storage(err.into())
    }
}

/// A convenient Result type alias for binlog-capture operations.
///
/// This is equivalent to `std::result::Result<T, binlog_capture::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
