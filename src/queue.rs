//! The bounded queue between the log reader's callbacks and the flush loop.
//!
//! Producers wait when the queue is full. Nothing is ever dropped, and
//! messages come out in the order the callbacks were invoked.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::event::{Position, PositionUpdate, RowChangeEvent};
use crate::source::EventHandler;
use crate::{Error, Result};

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    Position(PositionUpdate),
    Row(RowChangeEvent),
}

/// Creates the queue, returning the callback side and the consumer side.
pub fn channel(
    task_id: impl Into<String>,
    capacity: usize,
) -> (QueueProducer, mpsc::Receiver<QueueMessage>) {
    let (sender, receiver) = mpsc::channel(capacity);
    let producer = QueueProducer {
        task_id: task_id.into(),
        sender,
    };
    (producer, receiver)
}

/// [`EventHandler`] that turns log reader callbacks into queue messages.
#[derive(Clone)]
pub struct QueueProducer {
    task_id: String,
    sender: mpsc::Sender<QueueMessage>,
}

impl QueueProducer {
    pub async fn send(&self, message: QueueMessage) -> Result<()> {
        self.sender.send(message).await.map_err(|_| Error::QueueClosed)
    }

    async fn send_position(&self, position: Position, force: bool) -> Result<()> {
        self.send(QueueMessage::Position(PositionUpdate::new(position, force)))
            .await
    }
}

#[async_trait]
impl EventHandler for QueueProducer {
    async fn on_rotate(&self, next_position: u64, next_segment: &str) -> Result<()> {
        info!(
            task_id = %self.task_id,
            segment = next_segment,
            offset = next_position,
            "Log rotated"
        );
        self.send_position(Position::new(next_segment, next_position), true)
            .await
    }

    async fn on_schema_change(&self, position: Position, description: &str) -> Result<()> {
        info!(
            task_id = %self.task_id,
            position = %position,
            change = description,
            "Schema change"
        );
        self.send_position(position, true).await
    }

    async fn on_row_change(&self, event: RowChangeEvent) -> Result<()> {
        debug!(
            task_id = %self.task_id,
            table = %event.qualified_table(),
            action = %event.action,
            "Row change"
        );
        self.send(QueueMessage::Row(event)).await
    }

    async fn on_position_synced(&self, position: Position, forced: bool) -> Result<()> {
        debug!(task_id = %self.task_id, position = %position, forced, "Position synced");
        self.send_position(position, forced).await
    }
}
