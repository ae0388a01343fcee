//! Broker seams and the per-channel publish worker.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{BatchId, Message, RelayError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::route::{Route, Router};
use crate::tracker::{ConfirmOutcome, ConfirmTracker};

/// A broker connection able to open confirm-mode channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel with publisher confirms enabled. The channel reports
    /// every broker ack and nack into `tracker`.
    async fn open_channel(
        &self,
        id: u16,
        tracker: ConfirmTracker,
    ) -> Result<Box<dyn BrokerChannel>, RelayError>;

    /// Negotiated channel-max; 0 means the broker imposes no limit.
    fn channel_max(&self) -> u16;

    /// Broker-side flow control is holding publishes.
    fn is_blocked(&self) -> bool;
}

/// One broker channel in confirm mode.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Send one message as delivery `tag`. Returns once the frame is written;
    /// the confirm arrives later through the tracker.
    async fn publish(&mut self, route: &Route, message: &Message, tag: u64)
        -> Result<(), RelayError>;

    fn is_open(&self) -> bool;
}

/// Result of publishing one slice on one channel.
#[derive(Debug)]
pub struct ChannelReport {
    pub channel_id: u16,
    /// Messages written to the broker before confirms were awaited.
    pub sent: u64,
    pub outcome: Result<(), RelayError>,
    /// The whole slice, kept for a retry.
    pub messages: Vec<Message>,
}

impl ChannelReport {
    pub fn is_confirmed(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A pool slot: one broker channel, its confirm ledger and its FIFO.
pub struct RelayChannel {
    id: u16,
    channel: Box<dyn BrokerChannel>,
    tracker: ConfirmTracker,
    queue: VecDeque<Message>,
    faulted: bool,
}

impl RelayChannel {
    pub async fn open(id: u16, connection: &dyn BrokerConnection) -> Result<Self, RelayError> {
        let tracker = ConfirmTracker::new();
        let channel = connection.open_channel(id, tracker.clone()).await?;
        debug!(channel = id, "Opened publisher channel in confirm mode");
        Ok(Self {
            id,
            channel,
            tracker,
            queue: VecDeque::new(),
            faulted: false,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// A channel that timed out or closed is never reused.
    pub fn is_healthy(&self) -> bool {
        !self.faulted && self.channel.is_open() && !self.tracker.is_closed()
    }

    pub fn enqueue(&mut self, messages: Vec<Message>) {
        self.queue.extend(messages);
    }

    /// Drain the FIFO to the broker, then wait for its confirms.
    ///
    /// `abort` is cancelled when the connection becomes blocked; the worker
    /// stops before its next publish or while waiting.
    pub async fn publish_and_confirm(
        &mut self,
        router: &Router,
        batch: BatchId,
        confirm_timeout: Duration,
        abort: &CancellationToken,
    ) -> ChannelReport {
        let mut sent = 0u64;
        let mut messages = Vec::with_capacity(self.queue.len());
        let mut failure = None;

        while let Some(message) = self.queue.pop_front() {
            if abort.is_cancelled() {
                messages.push(message);
                failure = Some(RelayError::ConnectionBlocked);
                break;
            }
            let route = router.route(&message.message_type);
            let tag = self.tracker.record_publish(batch);
            let result = self.channel.publish(&route, &message, tag).await;
            messages.push(message);
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.faulted = true;
                    failure = Some(e);
                    break;
                }
            }
        }
        messages.extend(self.queue.drain(..));

        let outcome = match failure {
            Some(e) => Err(e),
            None => self.await_confirms(confirm_timeout, abort).await,
        };
        self.tracker.settle();

        debug!(
            channel = self.id,
            batch = %batch,
            sent,
            confirmed = outcome.is_ok(),
            "Channel dispatch finished"
        );

        ChannelReport {
            channel_id: self.id,
            sent,
            outcome,
            messages,
        }
    }

    async fn await_confirms(
        &mut self,
        confirm_timeout: Duration,
        abort: &CancellationToken,
    ) -> Result<(), RelayError> {
        let outcome = tokio::select! {
            outcome = self.tracker.wait_for_confirms(confirm_timeout) => outcome,
            _ = abort.cancelled() => return Err(RelayError::ConnectionBlocked),
        };

        match outcome {
            ConfirmOutcome::Confirmed => Ok(()),
            ConfirmOutcome::Nacked {
                first_failed_seq,
                batches,
            } => {
                let batches: Vec<String> = batches.iter().map(ToString::to_string).collect();
                warn!(
                    channel = self.id,
                    first_failed_seq,
                    batches = ?batches,
                    "Broker rejected deliveries"
                );
                Err(RelayError::PublishRejected {
                    channel: self.id,
                    first_failed_seq,
                })
            }
            ConfirmOutcome::TimedOut { pending } => {
                self.faulted = true;
                Err(RelayError::ConfirmTimeout {
                    channel: self.id,
                    pending,
                })
            }
            ConfirmOutcome::Closed { pending } => {
                self.faulted = true;
                Err(RelayError::ChannelClosed {
                    channel: self.id,
                    pending,
                })
            }
        }
    }
}
