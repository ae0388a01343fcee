//! Publisher channel pool: partitioning, parallel dispatch and channel health.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use relay_core::{BatchId, Message, RelayError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{BrokerConnection, ChannelReport, RelayChannel};
use crate::route::Router;

const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of channels to open: the requested count, or the CPU count,
/// capped by the broker's channel-max (0 = unlimited).
pub fn pool_size(parallelism: usize, requested: Option<usize>, channel_max: u16) -> usize {
    let wanted = requested.unwrap_or(parallelism).max(1);
    if channel_max == 0 {
        wanted
    } else {
        wanted.min(channel_max as usize)
    }
}

/// Split `messages` into `channel_count` slices.
///
/// Messages are grouped by type in order of first appearance and whole
/// groups are assigned round-robin, so every message of a type lands on the
/// same channel in its original order.
pub fn partition(messages: Vec<Message>, channel_count: usize) -> Vec<Vec<Message>> {
    let count = channel_count.max(1);
    let mut slices = vec![Vec::new(); count];
    let mut assigned: HashMap<String, usize> = HashMap::new();
    for message in messages {
        let next = assigned.len() % count;
        let slot = *assigned
            .entry(message.message_type.clone())
            .or_insert(next);
        slices[slot].push(message);
    }
    slices
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pool of confirm-mode channels on one connection, resized to the broker's
/// channel-max before every batch.
pub struct ChannelPool {
    connection: Arc<dyn BrokerConnection>,
    router: Arc<Router>,
    requested: Option<usize>,
    slots: Vec<Option<RelayChannel>>,
}

impl ChannelPool {
    /// Open the pool, sized from the machine's parallelism unless `requested`.
    pub async fn open(
        connection: Arc<dyn BrokerConnection>,
        router: Router,
        requested: Option<usize>,
    ) -> Result<Self, RelayError> {
        let size = pool_size(available_parallelism(), requested, connection.channel_max());

        let mut slots = Vec::with_capacity(size);
        for id in 0..size {
            slots.push(Some(RelayChannel::open(id as u16, connection.as_ref()).await?));
        }
        info!(
            channels = size,
            channel_max = connection.channel_max(),
            "Opened publisher channel pool"
        );

        Ok(Self {
            connection,
            router: Arc::new(router),
            requested,
            slots,
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn is_blocked(&self) -> bool {
        self.connection.is_blocked()
    }

    /// Replace every closed or faulted channel with a fresh one, then resize
    /// the pool to the current channel-max. Returns the number of channels
    /// opened.
    pub async fn ensure_healthy(&mut self) -> Result<usize, RelayError> {
        let mut opened = 0;
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(RelayChannel::is_healthy) {
                continue;
            }
            if slot.take().is_some() {
                warn!(channel = id, "Replacing unhealthy publisher channel");
            }
            *slot = Some(RelayChannel::open(id as u16, self.connection.as_ref()).await?);
            opened += 1;
        }

        let size = pool_size(
            available_parallelism(),
            self.requested,
            self.connection.channel_max(),
        );
        if size != self.slots.len() {
            info!(from = self.slots.len(), to = size, "Resizing publisher channel pool");
        }
        self.slots.truncate(size);
        while self.slots.len() < size {
            let id = self.slots.len() as u16;
            self.slots
                .push(Some(RelayChannel::open(id, self.connection.as_ref()).await?));
            opened += 1;
        }
        Ok(opened)
    }

    /// Publish each slice on its channel in parallel and wait for all of them.
    ///
    /// `assignments[i]` goes to channel `i`; empty slices are skipped. One
    /// report is returned per non-empty slice, in channel order.
    pub async fn publish_all(
        &mut self,
        assignments: Vec<Vec<Message>>,
        batch: BatchId,
        confirm_timeout: Duration,
    ) -> Vec<ChannelReport> {
        if self.connection.is_blocked() {
            warn!(batch = %batch, "Broker connection is blocked, not dispatching");
            return assignments
                .into_iter()
                .enumerate()
                .filter(|(_, messages)| !messages.is_empty())
                .map(|(id, messages)| ChannelReport {
                    channel_id: id as u16,
                    sent: 0,
                    outcome: Err(RelayError::ConnectionBlocked),
                    messages,
                })
                .collect();
        }

        let abort = CancellationToken::new();
        let watcher = watch_blocked(self.connection.clone(), abort.clone());

        let mut workers = Vec::new();
        let mut reports = Vec::new();
        for (id, messages) in assignments.into_iter().enumerate() {
            if messages.is_empty() {
                continue;
            }
            let Some(mut channel) = self.slots.get_mut(id).and_then(Option::take) else {
                reports.push(ChannelReport {
                    channel_id: id as u16,
                    sent: 0,
                    outcome: Err(RelayError::ChannelClosed {
                        channel: id as u16,
                        pending: 0,
                    }),
                    messages,
                });
                continue;
            };

            debug!(channel = id, messages = messages.len(), batch = %batch, "Dispatching slice");
            let retained = messages.clone();
            channel.enqueue(messages);
            let router = self.router.clone();
            let abort = abort.clone();
            let handle = tokio::spawn(async move {
                let report = channel
                    .publish_and_confirm(&router, batch, confirm_timeout, &abort)
                    .await;
                (channel, report)
            });
            workers.push((id, retained, handle));
        }

        let (meta, handles): (Vec<_>, Vec<_>) = workers
            .into_iter()
            .map(|(id, retained, handle)| ((id, retained), handle))
            .unzip();
        let results = join_all(handles).await;
        watcher.abort();

        for ((id, retained), result) in meta.into_iter().zip(results) {
            match result {
                Ok((channel, report)) => {
                    self.slots[id] = Some(channel);
                    reports.push(report);
                }
                Err(e) => {
                    error!(channel = id, error = %e, "Channel worker failed");
                    reports.push(ChannelReport {
                        channel_id: id as u16,
                        sent: 0,
                        outcome: Err(RelayError::ChannelClosed {
                            channel: id as u16,
                            pending: retained.len() as u64,
                        }),
                        messages: retained,
                    });
                }
            }
        }
        reports.sort_by_key(|r| r.channel_id);
        reports
    }
}

/// Cancel `abort` as soon as the connection reports flow control.
/// The returned task must be aborted once the dispatch it guards is over.
pub fn watch_blocked(
    connection: Arc<dyn BrokerConnection>,
    abort: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BLOCKED_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if connection.is_blocked() {
                warn!("Broker connection blocked, aborting dispatch");
                abort.cancel();
                return;
            }
        }
    })
}
