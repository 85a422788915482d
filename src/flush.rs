//! The single consumer of the event queue.
//!
//! Row events accumulate in a pending batch that is written to the task's
//! row bucket when it reaches `batch_size` or when the periodic tick fires.
//! The tick also persists the current position. Forced position updates are
//! persisted before the next queued message is looked at.
//!
//! A persisted checkpoint never points past an event that is still pending:
//! every checkpoint write is preceded by a flush.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointTracker;
use crate::event::RowChangeEvent;
use crate::queue::QueueMessage;
use crate::storage::DurableBuffer;
use crate::Result;

#[derive(Debug, Clone)]
pub struct FlushSettings {
    /// Pending events that trigger an immediate flush.
    pub batch_size: usize,
    /// Period of the flush/checkpoint tick. `None` disables the tick.
    pub flush_interval: Option<Duration>,
    /// Flush pending events and persist the position when cancelled.
    pub flush_on_shutdown: bool,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_interval: Some(Duration::from_micros(100)),
            flush_on_shutdown: true,
        }
    }
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub events_flushed: u64,
    pub flushes: u64,
    pub checkpoints: u64,
}

enum Step {
    Message(Option<QueueMessage>),
    Tick,
    Cancelled,
}

pub struct FlushLoop {
    task_id: String,
    receiver: mpsc::Receiver<QueueMessage>,
    buffer: Arc<dyn DurableBuffer>,
    row_bucket: String,
    tracker: CheckpointTracker,
    settings: FlushSettings,
    cancel: CancellationToken,
    pending: Vec<RowChangeEvent>,
    stats: FlushStats,
}

impl FlushLoop {
    pub fn new(
        task_id: impl Into<String>,
        receiver: mpsc::Receiver<QueueMessage>,
        buffer: Arc<dyn DurableBuffer>,
        row_bucket: impl Into<String>,
        tracker: CheckpointTracker,
        settings: FlushSettings,
        cancel: CancellationToken,
    ) -> Self {
        let pending = Vec::with_capacity(settings.batch_size);
        Self {
            task_id: task_id.into(),
            receiver,
            buffer,
            row_bucket: row_bucket.into(),
            tracker,
            settings,
            cancel,
            pending,
            stats: FlushStats::default(),
        }
    }

    /// Runs until cancelled, the queue closes, or a write fails.
    ///
    /// A failed serialization or write cancels the loop's token so the rest
    /// of the task winds down, and is returned as the error.
    pub async fn run(mut self) -> Result<FlushStats> {
        info!(
            task_id = %self.task_id,
            position = %self.tracker.current(),
            batch_size = self.settings.batch_size,
            "Flush loop started"
        );

        match self.drain().await {
            Ok(()) => {
                info!(
                    task_id = %self.task_id,
                    position = %self.tracker.current(),
                    events_flushed = self.stats.events_flushed,
                    checkpoints = self.stats.checkpoints,
                    "Flush loop stopped"
                );
                Ok(self.stats)
            }
            Err(e) => {
                error!(
                    task_id = %self.task_id,
                    position = %self.tracker.current(),
                    row_bucket = %self.row_bucket,
                    position_bucket = %self.tracker.bucket(),
                    pending = self.pending.len(),
                    error = %e,
                    "Flush loop aborted"
                );
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    async fn drain(&mut self) -> Result<()> {
        let batch_size = self.settings.batch_size.max(1);
        let mut ticker = self.settings.flush_interval.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            let step = tokio::select! {
                message = self.receiver.recv() => Step::Message(message),
                _ = next_tick(&mut ticker) => Step::Tick,
                _ = self.cancel.cancelled() => Step::Cancelled,
            };

            match step {
                Step::Message(Some(QueueMessage::Row(event))) => {
                    self.pending.push(event);
                    if self.pending.len() >= batch_size {
                        self.flush_pending()?;
                    }
                }
                Step::Message(Some(QueueMessage::Position(update))) => {
                    if self.tracker.advance(update) {
                        self.flush_pending()?;
                        self.tracker.persist_now()?;
                        self.stats.checkpoints += 1;
                    }
                }
                Step::Message(None) => {
                    debug!(task_id = %self.task_id, "Event queue closed");
                    self.flush_pending()?;
                    self.checkpoint()?;
                    return Ok(());
                }
                Step::Tick => {
                    self.flush_pending()?;
                    self.checkpoint()?;
                }
                Step::Cancelled => {
                    info!(
                        task_id = %self.task_id,
                        pending = self.pending.len(),
                        flush_on_shutdown = self.settings.flush_on_shutdown,
                        "Flush loop cancelled"
                    );
                    if self.settings.flush_on_shutdown {
                        self.flush_pending()?;
                        self.checkpoint()?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Appends the pending batch to the row bucket in one transaction.
    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let values = self
            .pending
            .iter()
            .map(serde_json::to_vec)
            .collect::<serde_json::Result<Vec<_>>>()?;
        self.buffer.put_sequenced_batch(&self.row_bucket, &values)?;

        let count = self.pending.len() as u64;
        self.pending.clear();
        self.stats.events_flushed += count;
        self.stats.flushes += 1;

        debug!(task_id = %self.task_id, bucket = %self.row_bucket, count, "Flushed row events");
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        if self.tracker.persist_if_dirty()? {
            self.stats.checkpoints += 1;
        }
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, ResumePoint};
    use crate::event::Position;
    use crate::queue::{self, QueueProducer};
    use crate::source::EventHandler;
    use crate::storage::MemoryBuffer;
    use crate::Error;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;

    const ROWS: &str = "t1_RowRequest";
    const POSITIONS: &str = "t1_Position";
    const KEY: &str = "bolt_position_key";

    fn row(n: i64) -> RowChangeEvent {
        RowChangeEvent::insert("shop", "orders", vec![json!(n)], 1_700_000_000)
    }

    fn settings(batch_size: usize, flush_interval: Option<Duration>) -> FlushSettings {
        FlushSettings {
            batch_size,
            flush_interval,
            flush_on_shutdown: true,
        }
    }

    fn spawn_loop(
        buffer: Arc<dyn DurableBuffer>,
        settings: FlushSettings,
    ) -> (QueueProducer, CancellationToken, JoinHandle<Result<FlushStats>>) {
        buffer.create_buckets_if_absent(&[ROWS, POSITIONS]).unwrap();
        let tracker = CheckpointTracker::new(
            CheckpointStore::new(buffer.clone(), POSITIONS, KEY),
            ResumePoint {
                position: Position::new("mysql-bin.000001", 0),
                from_checkpoint: false,
            },
        );
        let (producer, receiver) = queue::channel("t1", 64);
        let cancel = CancellationToken::new();
        let flush = FlushLoop::new("t1", receiver, buffer, ROWS, tracker, settings, cancel.clone());
        (producer, cancel, tokio::spawn(flush.run()))
    }

    async fn wait_for_size(buffer: &dyn DurableBuffer, expected: usize) {
        for _ in 0..200 {
            if buffer.size(ROWS).unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "row bucket never reached {} entries (has {})",
            expected,
            buffer.size(ROWS).unwrap()
        );
    }

    fn stored_rows(buffer: &dyn DurableBuffer) -> Vec<RowChangeEvent> {
        buffer
            .scan(ROWS, usize::MAX)
            .unwrap()
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).unwrap())
            .collect()
    }

    fn stored_position(buffer: &dyn DurableBuffer) -> Option<Position> {
        buffer
            .get_keyed(POSITIONS, KEY.as_bytes())
            .unwrap()
            .map(|raw| serde_json::from_slice(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_reaching_threshold_flushes_without_timer() {
        let buffer = Arc::new(MemoryBuffer::new());
        let (producer, cancel, handle) = spawn_loop(buffer.clone(), settings(20, None));

        for n in 0..19 {
            producer.on_row_change(row(n)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(buffer.size(ROWS).unwrap(), 0);

        producer.on_row_change(row(19)).await.unwrap();
        wait_for_size(buffer.as_ref(), 20).await;

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.events_flushed, 20);
    }

    #[tokio::test]
    async fn test_remainder_waits_for_forced_trigger() {
        let buffer = Arc::new(MemoryBuffer::new());
        let (producer, cancel, handle) = spawn_loop(buffer.clone(), settings(3, None));

        for n in 0..5 {
            producer.on_row_change(row(n)).await.unwrap();
        }
        wait_for_size(buffer.as_ref(), 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(buffer.size(ROWS).unwrap(), 3);

        producer
            .on_position_synced(Position::new("mysql-bin.000001", 500), true)
            .await
            .unwrap();
        wait_for_size(buffer.as_ref(), 5).await;
        assert_eq!(
            stored_position(buffer.as_ref()),
            Some(Position::new("mysql-bin.000001", 500))
        );

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.flushes, 2);
        assert_eq!(stored_rows(buffer.as_ref()), (0..5).map(row).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_events_flushed_in_order_without_gaps() {
        let buffer = Arc::new(MemoryBuffer::new());
        let (producer, cancel, handle) =
            spawn_loop(buffer.clone(), settings(7, Some(Duration::from_millis(5))));

        for n in 0..100 {
            producer.on_row_change(row(n)).await.unwrap();
        }
        wait_for_size(buffer.as_ref(), 100).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(stored_rows(buffer.as_ref()), (0..100).map(row).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_tick_persists_latest_position() {
        let buffer = Arc::new(MemoryBuffer::new());
        let (producer, cancel, handle) =
            spawn_loop(buffer.clone(), settings(100, Some(Duration::from_millis(5))));

        producer.on_row_change(row(1)).await.unwrap();
        producer
            .on_position_synced(Position::new("mysql-bin.000001", 320), false)
            .await
            .unwrap();

        wait_for_size(buffer.as_ref(), 1).await;
        for _ in 0..200 {
            if stored_position(buffer.as_ref()).map(|p| p.offset) == Some(320) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            stored_position(buffer.as_ref()),
            Some(Position::new("mysql-bin.000001", 320))
        );

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[derive(Debug, PartialEq)]
    enum Op {
        Checkpoint(Position),
        Append(usize),
    }

    /// Journals writes in the order they reach the store.
    #[derive(Default)]
    struct RecordingBuffer {
        inner: MemoryBuffer,
        journal: Mutex<Vec<Op>>,
    }

    impl DurableBuffer for RecordingBuffer {
        fn create_buckets_if_absent(&self, buckets: &[&str]) -> Result<()> {
            self.inner.create_buckets_if_absent(buckets)
        }
        fn put_keyed(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
            let position: Position = serde_json::from_slice(value).unwrap();
            self.journal.lock().unwrap().push(Op::Checkpoint(position));
            self.inner.put_keyed(bucket, key, value)
        }
        fn put_sequenced(&self, bucket: &str, value: &[u8]) -> Result<u64> {
            self.journal.lock().unwrap().push(Op::Append(1));
            self.inner.put_sequenced(bucket, value)
        }
        fn put_sequenced_batch(&self, bucket: &str, values: &[Vec<u8>]) -> Result<Vec<u64>> {
            self.journal.lock().unwrap().push(Op::Append(values.len()));
            self.inner.put_sequenced_batch(bucket, values)
        }
        fn get_keyed(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get_keyed(bucket, key)
        }
        fn delete_keyed(&self, bucket: &str, key: &[u8]) -> Result<()> {
            self.inner.delete_keyed(bucket, key)
        }
        fn size(&self, bucket: &str) -> Result<usize> {
            self.inner.size(bucket)
        }
        fn scan(&self, bucket: &str, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan(bucket, limit)
        }
    }

    #[tokio::test]
    async fn test_forced_position_persisted_before_next_message() {
        let buffer = Arc::new(RecordingBuffer::default());
        let (producer, cancel, handle) = spawn_loop(buffer.clone(), settings(1, None));

        let rotated = Position::new("mysql-bin.000002", 4);
        producer.on_row_change(row(1)).await.unwrap();
        producer.on_rotate(4, "mysql-bin.000002").await.unwrap();
        producer.on_row_change(row(2)).await.unwrap();
        wait_for_size(buffer.as_ref(), 2).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();

        let journal = buffer.journal.lock().unwrap();
        assert_eq!(
            journal[..3],
            [Op::Append(1), Op::Checkpoint(rotated), Op::Append(1)]
        );
    }

    #[tokio::test]
    async fn test_forced_position_flushes_pending_first() {
        let buffer = Arc::new(RecordingBuffer::default());
        let (producer, cancel, handle) = spawn_loop(buffer.clone(), settings(50, None));

        producer.on_row_change(row(1)).await.unwrap();
        producer.on_row_change(row(2)).await.unwrap();
        producer
            .on_schema_change(
                Position::new("mysql-bin.000001", 900),
                "ALTER TABLE orders ADD note TEXT",
            )
            .await
            .unwrap();
        wait_for_size(buffer.as_ref(), 2).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();

        let journal = buffer.journal.lock().unwrap();
        assert_eq!(
            journal[..2],
            [Op::Append(2), Op::Checkpoint(Position::new("mysql-bin.000001", 900))]
        );
    }

    #[tokio::test]
    async fn test_shutdown_flush_policy() {
        let buffer = Arc::new(MemoryBuffer::new());
        let (producer, cancel, handle) = spawn_loop(buffer.clone(), settings(10, None));
        producer.on_row_change(row(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(buffer.size(ROWS).unwrap(), 1);

        let buffer = Arc::new(MemoryBuffer::new());
        let mut no_flush = settings(10, None);
        no_flush.flush_on_shutdown = false;
        let (producer, cancel, handle) = spawn_loop(buffer.clone(), no_flush);
        producer.on_row_change(row(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(buffer.size(ROWS).unwrap(), 0);
        assert_eq!(stored_position(buffer.as_ref()), None);
    }

    #[tokio::test]
    async fn test_closed_queue_drains_and_exits() {
        let buffer = Arc::new(MemoryBuffer::new());
        let (producer, _cancel, handle) = spawn_loop(buffer.clone(), settings(10, None));

        producer.on_row_change(row(1)).await.unwrap();
        producer
            .on_position_synced(Position::new("mysql-bin.000001", 64), false)
            .await
            .unwrap();
        drop(producer);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.events_flushed, 1);
        assert_eq!(
            stored_position(buffer.as_ref()),
            Some(Position::new("mysql-bin.000001", 64))
        );
    }

    struct FailingBuffer {
        inner: MemoryBuffer,
    }

    impl DurableBuffer for FailingBuffer {
        fn create_buckets_if_absent(&self, buckets: &[&str]) -> Result<()> {
            self.inner.create_buckets_if_absent(buckets)
        }
        fn put_keyed(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.put_keyed(bucket, key, value)
        }
        fn put_sequenced(&self, _bucket: &str, _value: &[u8]) -> Result<u64> {
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }
        fn put_sequenced_batch(&self, _bucket: &str, _values: &[Vec<u8>]) -> Result<Vec<u64>> {
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }
        fn get_keyed(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get_keyed(bucket, key)
        }
        fn delete_keyed(&self, bucket: &str, key: &[u8]) -> Result<()> {
            self.inner.delete_keyed(bucket, key)
        }
        fn size(&self, bucket: &str) -> Result<usize> {
            self.inner.size(bucket)
        }
        fn scan(&self, bucket: &str, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan(bucket, limit)
        }
    }

    #[tokio::test]
    async fn test_write_failure_aborts_and_cancels() {
        let buffer = Arc::new(FailingBuffer {
            inner: MemoryBuffer::new(),
        });
        let (producer, cancel, handle) = spawn_loop(buffer, settings(1, None));

        producer.on_row_change(row(1)).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(cancel.is_cancelled());

        // the receiver is gone, so the producer side sees it immediately
        assert!(matches!(
            producer.on_row_change(row(2)).await,
            Err(Error::QueueClosed)
        ));
    }
}
