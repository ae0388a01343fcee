//! In-memory doubles of the source seams.
//!
//! Used by the orchestrator and exporter tests so the relay engine can be
//! exercised without a database. All doubles are cheaply cloneable handles
//! over shared state, so a test can keep one clone for inspection after
//! moving the other into the code under test.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    Dequeued, IdleNotifier, Message, OperationType, OutboxSource, RelayError, RowRange,
    SnapshotReader, SnapshotSource, WaitOutcome,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A failure the [`MemoryOutbox`] injects into its next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFault {
    /// Next dequeue fails with `SourceUnavailable`.
    Unavailable,
    /// Next dequeue fails with `SourceContention`.
    Contention,
    /// Next commit fails; the open batch returns to the outbox.
    CommitFails,
    /// The row with this key cannot be decoded on its next dequeue. It is
    /// removed with the batch but never handed out as a message.
    Undecodable(i64),
}

#[derive(Default)]
struct OutboxState {
    rows: BTreeMap<i64, Message>,
    next_sequence: i64,
    in_flight: Vec<Message>,
    faults: VecDeque<SourceFault>,
    dequeue_attempts: Vec<Instant>,
    commits: usize,
    rollbacks: usize,
}

impl OutboxState {
    fn restore_in_flight(&mut self) {
        for message in self.in_flight.drain(..) {
            self.rows.insert(message.sequence_key, message);
        }
    }
}

/// Transactional outbox held in memory.
///
/// Dequeued rows are moved to an in-flight set; `commit` discards them and
/// `rollback` (or a failed commit) puts them back.
#[derive(Clone, Default)]
pub struct MemoryOutbox {
    state: Arc<Mutex<OutboxState>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row with the next sequence key and return that key.
    pub fn insert(
        &self,
        message_type: &str,
        operation_type: OperationType,
        body: &str,
    ) -> i64 {
        let mut state = lock(&self.state);
        state.next_sequence += 1;
        let seq = state.next_sequence;
        state
            .rows
            .insert(seq, Message::new(seq, message_type, operation_type, body));
        seq
    }

    /// Append an already built message under its own sequence key.
    pub fn push(&self, message: Message) {
        let mut state = lock(&self.state);
        state.next_sequence = state.next_sequence.max(message.sequence_key);
        state.rows.insert(message.sequence_key, message);
    }

    pub fn inject(&self, fault: SourceFault) {
        lock(&self.state).faults.push_back(fault);
    }

    /// Rows currently in the outbox, excluding an open in-flight batch.
    pub fn rows(&self) -> Vec<Message> {
        lock(&self.state).rows.values().cloned().collect()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.state).rows.len()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    pub fn commits(&self) -> usize {
        lock(&self.state).commits
    }

    pub fn rollbacks(&self) -> usize {
        lock(&self.state).rollbacks
    }

    /// Instants of every dequeue call, including failed ones.
    pub fn dequeue_attempts(&self) -> Vec<Instant> {
        lock(&self.state).dequeue_attempts.clone()
    }
}

#[async_trait]
impl OutboxSource for MemoryOutbox {
    async fn dequeue_batch(&mut self, max_count: usize) -> Result<Dequeued, RelayError> {
        let mut state = lock(&self.state);
        state.dequeue_attempts.push(Instant::now());
        // An unresolved batch belongs to a transaction the server would have aborted.
        state.restore_in_flight();

        match state.faults.front() {
            Some(SourceFault::Unavailable) => {
                state.faults.pop_front();
                return Err(RelayError::source_unavailable(
                    "Failed to dequeue outbox batch",
                    "connection reset by peer",
                ));
            }
            Some(SourceFault::Contention) => {
                state.faults.pop_front();
                return Err(RelayError::source_contention(
                    "Failed to dequeue outbox batch",
                    "canceling statement due to statement timeout",
                ));
            }
            _ => {}
        }

        let keys: Vec<i64> = state.rows.keys().take(max_count).copied().collect();
        let rows_affected = keys.len() as u64;
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(message) = state.rows.remove(&key) {
                removed.push(message);
            }
        }
        state.in_flight = removed.clone();

        let mut messages = removed;
        if let Some(&SourceFault::Undecodable(seq)) = state.faults.front() {
            if messages.iter().any(|m| m.sequence_key == seq) {
                state.faults.pop_front();
                messages.retain(|m| m.sequence_key != seq);
            }
        }
        if messages.is_empty() {
            // Nothing left to relay: the source closes the transaction itself.
            if !state.in_flight.is_empty() {
                state.in_flight.clear();
                state.commits += 1;
            }
        }

        Ok(Dequeued {
            messages,
            rows_affected,
        })
    }

    async fn commit(&mut self) -> Result<(), RelayError> {
        let mut state = lock(&self.state);
        if state.faults.front() == Some(&SourceFault::CommitFails) {
            state.faults.pop_front();
            state.restore_in_flight();
            return Err(RelayError::source_unavailable(
                "Failed to commit outbox batch",
                "connection closed",
            ));
        }
        state.in_flight.clear();
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RelayError> {
        let mut state = lock(&self.state);
        state.restore_in_flight();
        state.rollbacks += 1;
        Ok(())
    }
}

#[derive(Default)]
struct NotifierState {
    script: VecDeque<Result<WaitOutcome, String>>,
    timeouts: Vec<Duration>,
}

/// Idle notifier replaying a script of outcomes.
///
/// Once the script is exhausted every call sleeps for the full timeout and
/// reports `TimedOut`, which under a paused tokio clock advances instantly.
#[derive(Clone, Default)]
pub struct ScriptedNotifier {
    state: Arc<Mutex<NotifierState>>,
}

impl ScriptedNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: WaitOutcome) -> &Self {
        lock(&self.state).script.push_back(Ok(outcome));
        self
    }

    /// Queue a wait that fails as if the notification connection dropped.
    pub fn push_error(&self, message: &str) -> &Self {
        lock(&self.state).script.push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.state).timeouts.len()
    }

    /// Timeout argument of every call, in order.
    pub fn timeouts(&self) -> Vec<Duration> {
        lock(&self.state).timeouts.clone()
    }
}

#[async_trait]
impl IdleNotifier for ScriptedNotifier {
    async fn await_work(&mut self, timeout: Duration) -> Result<WaitOutcome, RelayError> {
        let next = {
            let mut state = lock(&self.state);
            state.timeouts.push(timeout);
            state.script.pop_front()
        };
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(RelayError::source_unavailable(
                "Notification connection lost",
                message,
            )),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(WaitOutcome::TimedOut)
            }
        }
    }
}

/// Snapshot held in memory; row numbers are 1-based positions.
#[derive(Clone, Default)]
pub struct MemorySnapshot {
    rows: Arc<Vec<Message>>,
    reads: Arc<Mutex<Vec<RowRange>>>,
}

impl MemorySnapshot {
    /// Number the messages in sequence order, like the snapshot statement does.
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.sequence_key);
        Self {
            rows: Arc::new(messages),
            reads: Arc::default(),
        }
    }

    /// Every range read by any reader, in completion order.
    pub fn reads(&self) -> Vec<RowRange> {
        lock(&self.reads).clone()
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshot {
    async fn max_row_number(&self) -> Result<i64, RelayError> {
        Ok(self.rows.len() as i64)
    }

    async fn reader(&self) -> Result<Box<dyn SnapshotReader>, RelayError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl SnapshotReader for MemorySnapshot {
    async fn read_range(&mut self, range: RowRange) -> Result<Vec<Message>, RelayError> {
        lock(&self.reads).push(range);
        let rows = self
            .rows
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let row_number = *i as i64 + 1;
                row_number >= range.first && row_number <= range.last
            })
            .map(|(_, m)| m.clone())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_outbox_rollback_restores_rows() {
        let outbox = MemoryOutbox::new();
        for _ in 0..5 {
            outbox.insert("A", OperationType::Insert, "{}");
        }

        let mut source = outbox.clone();
        let batch = source.dequeue_batch(3).await.unwrap();
        assert_eq!(batch.rows_affected, 3);
        assert_eq!(
            batch.messages.iter().map(|m| m.sequence_key).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(outbox.remaining(), 2);

        source.rollback().await.unwrap();
        assert_eq!(outbox.remaining(), 5);
        assert_eq!(outbox.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_memory_outbox_commit_failure_returns_rows() {
        let outbox = MemoryOutbox::new();
        outbox.insert("A", OperationType::Insert, "{}");
        outbox.inject(SourceFault::CommitFails);

        let mut source = outbox.clone();
        source.dequeue_batch(10).await.unwrap();
        let err = source.commit().await.unwrap_err();
        assert!(err.is_environmental());
        assert_eq!(outbox.remaining(), 1);
        assert_eq!(outbox.commits(), 0);
    }

    #[tokio::test]
    async fn test_memory_outbox_dequeue_faults() {
        let outbox = MemoryOutbox::new();
        outbox.insert("A", OperationType::Insert, "{}");
        outbox.inject(SourceFault::Contention);
        outbox.inject(SourceFault::Unavailable);

        let mut source = outbox.clone();
        assert!(matches!(
            source.dequeue_batch(10).await,
            Err(RelayError::SourceContention { .. })
        ));
        assert!(matches!(
            source.dequeue_batch(10).await,
            Err(RelayError::SourceUnavailable { .. })
        ));
        assert_eq!(source.dequeue_batch(10).await.unwrap().rows_affected, 1);
        assert_eq!(outbox.dequeue_attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_notifier_times_out_when_exhausted() {
        let handle = ScriptedNotifier::new();
        handle.push(WaitOutcome::NotificationReceived);

        let mut notifier = handle.clone();
        assert_eq!(
            notifier.await_work(Duration::from_secs(5)).await.unwrap(),
            WaitOutcome::NotificationReceived
        );

        let start = Instant::now();
        assert_eq!(
            notifier.await_work(Duration::from_secs(5)).await.unwrap(),
            WaitOutcome::TimedOut
        );
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(handle.calls(), 2);
    }

    #[tokio::test]
    async fn test_memory_snapshot_reads_ranges() {
        let messages = (1..=5)
            .map(|i| Message::new(i * 10, "A", OperationType::Insert, ""))
            .collect();
        let snapshot = MemorySnapshot::new(messages);
        assert_eq!(snapshot.max_row_number().await.unwrap(), 5);

        let mut reader = snapshot.reader().await.unwrap();
        let rows = reader.read_range(RowRange::new(2, 3)).await.unwrap();
        assert_eq!(
            rows.iter().map(|m| m.sequence_key).collect::<Vec<_>>(),
            vec![20, 30]
        );
        assert_eq!(snapshot.reads(), vec![RowRange::new(2, 3)]);
    }
}
