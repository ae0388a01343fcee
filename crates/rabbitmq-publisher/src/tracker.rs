//! Publisher-confirm bookkeeping for one channel.
//!
//! Delivery tags are assigned locally in publish order, starting at 1 on a
//! freshly confirm-selected channel, which is the numbering the broker uses.
//! The broker's acks and nacks are fed in by a listener (see
//! [`crate::amqp`]) and the publishing worker waits on the result.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use relay_core::BatchId;
use tokio::sync::watch;

/// Final state of a channel's outstanding confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    /// At least one delivery was rejected. `batches` lists every batch that
    /// owns a rejected tag, in publish order.
    Nacked {
        first_failed_seq: u64,
        batches: Vec<BatchId>,
    },
    TimedOut {
        pending: u64,
    },
    Closed {
        pending: u64,
    },
}

#[derive(Debug)]
struct LedgerEntry {
    batch: BatchId,
    sent: u64,
    nacked: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    /// Tag of the most recent publish; 0 before the first one.
    last_published: u64,
    /// Tags at or below this belong to already settled outcomes.
    settled_through: u64,
    outstanding: BTreeSet<u64>,
    entries: Vec<LedgerEntry>,
    first_nack: Option<u64>,
    closed: bool,
}

impl Ledger {
    fn resolve(&mut self, tag: u64, multiple: bool) {
        if tag >= self.last_published {
            self.outstanding.clear();
        } else if multiple {
            self.outstanding.retain(|t| *t > tag);
        } else {
            self.outstanding.remove(&tag);
        }
    }

    /// Flag the batch whose cumulative sent count first reaches `tag`.
    fn attribute_nack(&mut self, tag: u64) {
        let mut cumulative = self.settled_through;
        for entry in self.entries.iter_mut() {
            cumulative += entry.sent;
            if tag <= cumulative {
                entry.nacked = true;
                return;
            }
        }
    }

    fn outcome(&self) -> Option<ConfirmOutcome> {
        if !self.outstanding.is_empty() {
            return self.closed.then(|| ConfirmOutcome::Closed {
                pending: self.outstanding.len() as u64,
            });
        }
        match self.first_nack {
            Some(first_failed_seq) => Some(ConfirmOutcome::Nacked {
                first_failed_seq,
                batches: self
                    .entries
                    .iter()
                    .filter(|e| e.nacked)
                    .map(|e| e.batch)
                    .collect(),
            }),
            None => Some(ConfirmOutcome::Confirmed),
        }
    }
}

/// Shared handle over one channel's confirm ledger.
///
/// Cloning is cheap; the publishing worker and the confirm listener each
/// hold a clone.
#[derive(Clone)]
pub struct ConfirmTracker {
    ledger: Arc<watch::Sender<Ledger>>,
}

impl Default for ConfirmTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmTracker {
    pub fn new() -> Self {
        let (ledger, _) = watch::channel(Ledger::default());
        Self {
            ledger: Arc::new(ledger),
        }
    }

    /// Allocate the delivery tag of the next publish and charge it to `batch`.
    pub fn record_publish(&self, batch: BatchId) -> u64 {
        let mut tag = 0;
        self.ledger.send_modify(|ledger| {
            ledger.last_published += 1;
            tag = ledger.last_published;
            ledger.outstanding.insert(tag);
            match ledger.entries.last_mut() {
                Some(entry) if entry.batch == batch => entry.sent += 1,
                _ => ledger.entries.push(LedgerEntry {
                    batch,
                    sent: 1,
                    nacked: false,
                }),
            }
        });
        tag
    }

    pub fn ack(&self, tag: u64, multiple: bool) {
        self.ledger.send_modify(|ledger| {
            if tag > ledger.settled_through {
                ledger.resolve(tag, multiple);
            }
        });
    }

    pub fn nack(&self, tag: u64, multiple: bool) {
        self.ledger.send_modify(|ledger| {
            if tag <= ledger.settled_through {
                return;
            }
            let first_failed = if multiple {
                ledger
                    .outstanding
                    .iter()
                    .next()
                    .copied()
                    .filter(|t| *t <= tag)
                    .unwrap_or(tag)
            } else {
                tag
            };
            ledger.first_nack = Some(match ledger.first_nack {
                Some(existing) => existing.min(first_failed),
                None => first_failed,
            });
            ledger.attribute_nack(first_failed);
            // Later tags covered by a multiple nack belong to the same rejection.
            if multiple {
                let covered: Vec<u64> = ledger
                    .outstanding
                    .range(first_failed..=tag)
                    .copied()
                    .collect();
                for t in covered {
                    ledger.attribute_nack(t);
                }
                ledger.outstanding.retain(|t| *t > tag);
            } else {
                ledger.outstanding.remove(&tag);
            }
        });
    }

    /// The channel is gone; pending confirms will never arrive.
    pub fn close(&self) {
        self.ledger.send_modify(|ledger| ledger.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.ledger.borrow().closed
    }

    pub fn last_published(&self) -> u64 {
        self.ledger.borrow().last_published
    }

    pub fn pending(&self) -> u64 {
        self.ledger.borrow().outstanding.len() as u64
    }

    /// Wait until every outstanding delivery is acked or nacked, the channel
    /// closes, or `timeout` elapses.
    pub async fn wait_for_confirms(&self, timeout: Duration) -> ConfirmOutcome {
        let mut rx = self.ledger.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = rx.borrow_and_update().outcome() {
                return outcome;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // The sender lives in `self`, so the channel cannot drop here.
                Ok(Err(_)) => {
                    return ConfirmOutcome::Closed {
                        pending: self.pending(),
                    }
                }
                Err(_) => {
                    return ConfirmOutcome::TimedOut {
                        pending: self.pending(),
                    }
                }
            }
        }
    }

    /// Forget the consumed outcome. The tag counter keeps running.
    pub fn settle(&self) {
        self.ledger.send_modify(|ledger| {
            ledger.settled_through = ledger.last_published;
            ledger.outstanding.clear();
            ledger.entries.clear();
            ledger.first_nack = None;
        });
    }
}
