//! Continuous relay: dequeue, fan out, confirm, commit.
//!
//! The relay holds the source transaction open while the pool publishes and
//! waits for publisher confirms. Only a batch confirmed on every channel is
//! committed; anything else is rolled back so the rows are relayed again.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use outbox_relay_rabbitmq::{partition, ChannelPool, ChannelReport};
use relay_core::{report, BatchId, IdleNotifier, Message, OutboxSource, RelayError, WaitOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RelaySettings;

/// Timing and sizing of the relay loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub messages_per_transaction: usize,
    pub confirm_timeout: Duration,
    pub critical_error_delay: Duration,
    pub notification_timeout: Duration,
    pub polling_interval: Duration,
}

impl From<&RelaySettings> for RelayConfig {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            messages_per_transaction: settings.messages_per_transaction,
            confirm_timeout: settings.confirm_timeout,
            critical_error_delay: settings.critical_error_delay,
            notification_timeout: settings.notification_timeout,
            polling_interval: settings.polling_interval,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Dequeuing,
    Publishing,
    Confirming,
    Committing,
    Backoff,
}

/// Counters reported when the relay stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Non-empty batches processed, successful or not.
    pub cycles: u64,
    pub messages_relayed: u64,
    pub failures: u64,
    pub retries: u64,
}

/// Result of one dequeue-publish-commit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to relay, or the source was contended.
    Empty,
    /// The batch was confirmed and committed; carries the messages sent.
    Relayed(u64),
    /// The batch was rolled back or never dequeued.
    Failed,
}

/// What went wrong with a batch, for reconciliation.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub batch: BatchId,
    pub channels: Vec<u16>,
    pub message_types: BTreeSet<String>,
    pub uuids: Vec<Uuid>,
    pub errors: Vec<String>,
}

impl FailureReport {
    fn new(batch: BatchId, error: &RelayError, messages: &[Message]) -> Self {
        Self {
            batch,
            channels: Vec::new(),
            message_types: messages.iter().map(|m| m.message_type.clone()).collect(),
            uuids: messages.iter().map(|m| m.uuid).collect(),
            errors: vec![report(error)],
        }
    }

    fn from_reports(batch: BatchId, reports: &[ChannelReport]) -> Self {
        let mut failure = Self {
            batch,
            channels: Vec::new(),
            message_types: BTreeSet::new(),
            uuids: Vec::new(),
            errors: Vec::new(),
        };
        for r in reports {
            failure.channels.push(r.channel_id);
            failure
                .message_types
                .extend(r.messages.iter().map(|m| m.message_type.clone()));
            failure.uuids.extend(r.messages.iter().map(|m| m.uuid));
            if let Err(e) = &r.outcome {
                failure.errors.push(report(e));
            }
        }
        failure
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<&str> = self.message_types.iter().map(String::as_str).collect();
        let uuids: Vec<String> = self.uuids.iter().map(Uuid::to_string).collect();
        write!(
            f,
            "batch {} failed on channels {:?}; message types [{}]; {} messages [{}]; errors: {}",
            self.batch,
            self.channels,
            types.join(", "),
            self.uuids.len(),
            uuids.join(", "),
            self.errors.join("; ")
        )
    }
}

/// The relay engine over one source, one notifier and one channel pool.
pub struct Relay<S, N> {
    source: S,
    notifier: N,
    pool: ChannelPool,
    config: RelayConfig,
    shutdown: CancellationToken,
    state: RelayState,
    polling: bool,
    stats: RelayStats,
}

impl<S, N> Relay<S, N>
where
    S: OutboxSource,
    N: IdleNotifier,
{
    pub fn new(
        source: S,
        notifier: N,
        pool: ChannelPool,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            notifier,
            pool,
            config,
            shutdown,
            state: RelayState::Idle,
            polling: false,
            stats: RelayStats::default(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Relay until the shutdown token is cancelled.
    ///
    /// The backlog is drained before the first idle wait. Recoverable
    /// failures never end the loop; they roll back and back off.
    pub async fn run(mut self) -> RelayStats {
        info!(
            channels = self.pool.size(),
            messages_per_transaction = self.config.messages_per_transaction,
            "Outbox relay started"
        );

        let mut next = RelayState::Dequeuing;
        while !self.shutdown.is_cancelled() {
            next = match next {
                RelayState::Idle => self.wait_for_work().await,
                RelayState::Backoff => self.back_off().await,
                _ => match self.cycle().await {
                    CycleOutcome::Empty => RelayState::Idle,
                    CycleOutcome::Relayed(_) => RelayState::Dequeuing,
                    CycleOutcome::Failed => RelayState::Backoff,
                },
            };
        }

        info!(
            cycles = self.stats.cycles,
            messages = self.stats.messages_relayed,
            failures = self.stats.failures,
            retries = self.stats.retries,
            "Outbox relay stopped"
        );
        self.stats
    }

    fn transition(&mut self, to: RelayState) {
        debug!(from = ?self.state, to = ?to, "Relay state change");
        self.state = to;
    }

    async fn wait_for_work(&mut self) -> RelayState {
        self.transition(RelayState::Idle);

        if self.polling {
            sleep_or_shutdown(&self.shutdown, self.config.polling_interval).await;
            return RelayState::Dequeuing;
        }

        let outcome = tokio::select! {
            outcome = self.notifier.await_work(self.config.notification_timeout) => outcome,
            _ = self.shutdown.cancelled() => return RelayState::Idle,
        };

        match outcome {
            Ok(WaitOutcome::NotificationReceived) => debug!("Outbox notification received"),
            Ok(WaitOutcome::TimedOut) => debug!("Idle wait timed out, checking the outbox"),
            Ok(WaitOutcome::NotSupported) => {
                info!(
                    interval = ?self.config.polling_interval,
                    "Source cannot notify, polling for the rest of the run"
                );
                self.polling = true;
                sleep_or_shutdown(&self.shutdown, self.config.polling_interval).await;
            }
            Err(e) => {
                warn!(error = %report(&e), "Idle wait failed, polling once");
                sleep_or_shutdown(&self.shutdown, self.config.polling_interval).await;
            }
        }
        RelayState::Dequeuing
    }

    async fn back_off(&mut self) -> RelayState {
        self.transition(RelayState::Backoff);
        warn!(delay = ?self.config.critical_error_delay, "Backing off after failed cycle");
        sleep_or_shutdown(&self.shutdown, self.config.critical_error_delay).await;
        RelayState::Idle
    }

    /// Dequeue one batch and relay it.
    pub async fn cycle(&mut self) -> CycleOutcome {
        self.transition(RelayState::Dequeuing);

        let dequeued = match self
            .source
            .dequeue_batch(self.config.messages_per_transaction)
            .await
        {
            Ok(dequeued) => dequeued,
            Err(e @ RelayError::SourceContention { .. }) => {
                warn!(error = %report(&e), "Outbox contended, treating as empty");
                return CycleOutcome::Empty;
            }
            Err(e) => {
                error!(error = %report(&e), "Failed to dequeue outbox batch");
                self.stats.failures += 1;
                return CycleOutcome::Failed;
            }
        };

        let Some(batch) = BatchId::for_messages(&dequeued.messages) else {
            // Rows removed without messages were quarantined by the source.
            return if dequeued.rows_affected > 0 {
                CycleOutcome::Relayed(0)
            } else {
                CycleOutcome::Empty
            };
        };
        self.stats.cycles += 1;
        debug!(batch = %batch, rows = dequeued.rows_affected, "Dequeued outbox batch");

        if self.shutdown.is_cancelled() {
            info!(batch = %batch, "Shutdown requested, returning batch to the outbox");
            self.roll_back(batch).await;
            return CycleOutcome::Empty;
        }

        match self.publish(batch, dequeued.messages).await {
            Ok(sent) => {
                self.transition(RelayState::Committing);
                match self.source.commit().await {
                    Ok(()) => {
                        self.stats.messages_relayed += sent;
                        info!(batch = %batch, messages = sent, "Relayed outbox batch");
                        CycleOutcome::Relayed(sent)
                    }
                    Err(e) => {
                        error!(
                            batch = %batch,
                            error = %report(&e),
                            "Failed to commit relayed batch, it will be relayed again"
                        );
                        self.stats.failures += 1;
                        CycleOutcome::Failed
                    }
                }
            }
            Err(failure) => {
                self.roll_back(batch).await;
                error!("Relay failure: {failure}");
                self.stats.failures += 1;
                CycleOutcome::Failed
            }
        }
    }

    async fn roll_back(&mut self, batch: BatchId) {
        if let Err(e) = self.source.rollback().await {
            // The server aborts the open transaction with the connection.
            error!(batch = %batch, error = %report(&e), "Failed to roll back batch");
        }
    }

    /// Publish a batch across the pool, retrying failed slices once.
    /// Returns the number of messages sent on confirmed slices.
    async fn publish(&mut self, batch: BatchId, messages: Vec<Message>) -> Result<u64, FailureReport> {
        self.transition(RelayState::Publishing);
        if let Err(e) = self.pool.ensure_healthy().await {
            return Err(FailureReport::new(batch, &e, &messages));
        }

        let assignments = partition(messages, self.pool.size());
        let reports = self
            .pool
            .publish_all(assignments, batch, self.config.confirm_timeout)
            .await;
        self.transition(RelayState::Confirming);

        let (mut sent, failed) = split_reports(reports);
        if failed.is_empty() {
            return Ok(sent);
        }

        for r in &failed {
            if let Err(e) = &r.outcome {
                warn!(channel = r.channel_id, batch = %batch, error = %report(e), "Channel slice failed");
            }
        }
        let environmental = failed
            .iter()
            .any(|r| matches!(&r.outcome, Err(e) if e.is_environmental()));
        if environmental {
            return Err(FailureReport::from_reports(batch, &failed));
        }

        self.stats.retries += 1;
        let mut retry: Vec<Message> = failed.into_iter().flat_map(|r| r.messages).collect();
        retry.sort_by_key(|m| m.sequence_key);
        warn!(batch = %batch, messages = retry.len(), "Retrying failed slices once");

        self.transition(RelayState::Publishing);
        match self.pool.ensure_healthy().await {
            Ok(replaced) if replaced > 0 => debug!(replaced, "Replaced channels before retry"),
            Ok(_) => {}
            Err(e) => return Err(FailureReport::new(batch, &e, &retry)),
        }

        let assignments = partition(retry, self.pool.size());
        let reports = self
            .pool
            .publish_all(assignments, batch, self.config.confirm_timeout)
            .await;
        self.transition(RelayState::Confirming);

        let (retried, failed) = split_reports(reports);
        sent += retried;
        if failed.is_empty() {
            Ok(sent)
        } else {
            Err(FailureReport::from_reports(batch, &failed))
        }
    }
}

/// Sleep unless shutdown is requested first.
async fn sleep_or_shutdown(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.cancelled() => {}
    }
}

/// Sum the confirmed slices and keep the failed ones.
fn split_reports(reports: Vec<ChannelReport>) -> (u64, Vec<ChannelReport>) {
    let mut sent = 0;
    let mut failed = Vec::new();
    for r in reports {
        if r.is_confirmed() {
            sent += r.sent;
        } else {
            failed.push(r);
        }
    }
    (sent, failed)
}
