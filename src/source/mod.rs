//! Log reader interfaces.
//!
//! A log reader connects to the source, decodes the replication stream and
//! pushes what it sees into an [`EventHandler`]. The pipeline only starts it
//! at a position and closes it; everything else is the reader's business.

pub mod file;

pub use file::{FileLogReader, LogEntry};

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::event::{Position, RowChangeEvent};
use crate::Result;

/// Callbacks a log reader invokes, in log order, from its own task.
///
/// Implementations enqueue and return. An `Err` tells the reader to stop
/// streaming.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The log moved to `next_segment`, starting at `next_position`.
    async fn on_rotate(&self, next_position: u64, next_segment: &str) -> Result<()>;

    /// A DDL statement was applied; `position` is the position after it.
    async fn on_schema_change(&self, position: Position, description: &str) -> Result<()>;

    async fn on_row_change(&self, event: RowChangeEvent) -> Result<()>;

    /// The reader has consumed the log up to `position`.
    async fn on_position_synced(&self, position: Position, forced: bool) -> Result<()>;
}

/// The capabilities the task needs from a log reader.
#[async_trait]
pub trait LogReader: Send + Sync {
    /// Installs the handler used by the next [`start_from`](Self::start_from).
    fn set_event_handler(&mut self, handler: Arc<dyn EventHandler>);

    /// Connects and begins streaming from `position` in the background.
    ///
    /// Returns once the stream is established, or with the error that
    /// prevented it. `run` is the token of the pipeline run: streaming stops
    /// when it is cancelled, and a reader that fails after returning cancels
    /// it.
    async fn start_from(&mut self, position: Position, run: CancellationToken) -> Result<()>;

    /// Stops streaming and releases the connection. Safe to call when not
    /// started.
    async fn close(&mut self);
}
