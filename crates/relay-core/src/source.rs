//! Source-side seams of the relay.
//!
//! The orchestrator drives these traits; the PostgreSQL crate implements
//! them against a real outbox and [`crate::testing`] implements them in memory.

use std::time::Duration;

use async_trait::async_trait;

use crate::{Message, RelayError, RowRange};

/// Result of one dequeue: the rows removed inside the open source transaction.
#[derive(Debug, Default)]
pub struct Dequeued {
    /// Messages in ascending `sequence_key` order.
    pub messages: Vec<Message>,
    pub rows_affected: u64,
}

/// Transactional access to the outbox table.
///
/// `dequeue_batch` removes up to `max_count` of the oldest rows inside a
/// transaction that stays open until `commit` or `rollback` is called. Only
/// the coordinating task touches the source.
#[async_trait]
pub trait OutboxSource: Send {
    async fn dequeue_batch(&mut self, max_count: usize) -> Result<Dequeued, RelayError>;

    /// Make the delete of the last dequeued batch durable.
    async fn commit(&mut self) -> Result<(), RelayError>;

    /// Return the last dequeued batch to the outbox.
    async fn rollback(&mut self) -> Result<(), RelayError>;
}

/// Outcome of waiting for new outbox rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    NotificationReceived,
    /// The database has no notification primitive; poll for the rest of the run.
    NotSupported,
    /// The common idle outcome, not an error.
    TimedOut,
}

/// Blocks until new rows are likely available or the timeout elapses.
#[async_trait]
pub trait IdleNotifier: Send {
    async fn await_work(&mut self, timeout: Duration) -> Result<WaitOutcome, RelayError>;
}

/// A materialized copy of a source table, numbered by row.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Highest row number in the snapshot, 0 when empty.
    async fn max_row_number(&self) -> Result<i64, RelayError>;

    /// Open a reader for one export worker.
    async fn reader(&self) -> Result<Box<dyn SnapshotReader>, RelayError>;
}

/// Reads row-number ranges of a snapshot.
#[async_trait]
pub trait SnapshotReader: Send {
    async fn read_range(&mut self, range: RowRange) -> Result<Vec<Message>, RelayError>;
}
