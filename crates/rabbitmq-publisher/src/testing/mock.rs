//! In-memory broker double.
//!
//! `MockBroker` implements [`BrokerConnection`]; each opened channel follows
//! a [`ChannelScript`] deciding how the broker confirms its deliveries.
//! Confirms are delivered synchronously from `publish`, so a waiting worker
//! observes them without any real I/O.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use relay_core::{Message, RelayError};

use crate::channel::{BrokerChannel, BrokerConnection};
use crate::route::Route;
use crate::tracker::ConfirmTracker;

/// How the broker answers the deliveries of one channel lifetime.
/// Tags are the channel's delivery tags, starting at 1.
#[derive(Debug, Clone, Default)]
pub struct ChannelScript {
    silent: bool,
    nacks: BTreeSet<u64>,
    multiple_acks: BTreeSet<u64>,
    fail_publish_at: Option<u64>,
    close_at: Option<u64>,
    block_at: Option<u64>,
    drop_connection_at: Option<(u64, usize)>,
}

impl ChannelScript {
    /// Ack every delivery individually.
    pub fn acking() -> Self {
        Self::default()
    }

    /// Never confirm anything unless told to by `ack_multiple_at`.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn nack(mut self, tag: u64) -> Self {
        self.nacks.insert(tag);
        self
    }

    /// Send a `multiple` ack when `tag` is published.
    pub fn ack_multiple_at(mut self, tag: u64) -> Self {
        self.multiple_acks.insert(tag);
        self
    }

    /// Fail the publish of `tag` and close the channel.
    pub fn fail_publish_at(mut self, tag: u64) -> Self {
        self.fail_publish_at = Some(tag);
        self
    }

    /// Accept `tag`, then close the channel before confirming it.
    pub fn close_at(mut self, tag: u64) -> Self {
        self.close_at = Some(tag);
        self
    }

    /// Put the connection under flow control when `tag` is published.
    /// No further confirms are sent on this channel.
    pub fn block_connection_at(mut self, tag: u64) -> Self {
        self.block_at = Some(tag);
        self
    }

    /// Accept `tag`, then lose the whole connection before confirming it.
    /// The next `refused` reconnect attempts fail.
    pub fn drop_connection_at(mut self, tag: u64, refused: usize) -> Self {
        self.drop_connection_at = Some((tag, refused));
        self
    }
}

/// One message as received by the broker.
#[derive(Debug, Clone)]
pub struct Published {
    pub channel_id: u16,
    pub tag: u64,
    pub route: Route,
    pub message: Message,
}

#[derive(Default)]
struct BrokerState {
    scripts: HashMap<u16, VecDeque<ChannelScript>>,
    published: Vec<Published>,
    opened: Vec<u16>,
    channel_max: u16,
    blocked: bool,
    open_failures: usize,
    generation: u64,
    disconnected: bool,
    refused_reconnects: usize,
    reconnects: usize,
}

impl BrokerState {
    /// Every channel of the current connection is gone with it.
    fn drop_connection(&mut self, refused: usize) {
        self.generation += 1;
        self.disconnected = true;
        self.refused_reconnects = refused;
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable broker connection.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel_max(self, channel_max: u16) -> Self {
        lock(&self.state).channel_max = channel_max;
        self
    }

    /// Script the next channel opened under `channel_id`. Scripts queue up:
    /// a replacement channel takes the next one, then falls back to acking.
    pub fn script(&self, channel_id: u16, script: ChannelScript) {
        lock(&self.state)
            .scripts
            .entry(channel_id)
            .or_default()
            .push_back(script);
    }

    /// Fail the next `count` channel opens with `BrokerUnavailable`.
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).open_failures = count;
    }

    pub fn set_blocked(&self, blocked: bool) {
        lock(&self.state).blocked = blocked;
    }

    /// Change the channel-max the broker reports from now on.
    pub fn set_channel_max(&self, channel_max: u16) {
        lock(&self.state).channel_max = channel_max;
    }

    /// Lose the connection; the next `refused` reconnect attempts fail.
    pub fn drop_connection(&self, refused: usize) {
        lock(&self.state).drop_connection(refused);
    }

    /// Successful reconnects after a lost connection.
    pub fn reconnects(&self) -> usize {
        lock(&self.state).reconnects
    }

    pub fn connection(&self) -> Arc<dyn BrokerConnection> {
        Arc::new(self.clone())
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.state).published.clone()
    }

    /// Sequence keys published on `channel_id`, in publish order.
    pub fn sequences_on(&self, channel_id: u16) -> Vec<i64> {
        lock(&self.state)
            .published
            .iter()
            .filter(|p| p.channel_id == channel_id)
            .map(|p| p.message.sequence_key)
            .collect()
    }

    /// Channel ids in the order channels were opened.
    pub fn opened(&self) -> Vec<u16> {
        lock(&self.state).opened.clone()
    }
}

#[async_trait]
impl BrokerConnection for MockBroker {
    async fn open_channel(
        &self,
        id: u16,
        tracker: ConfirmTracker,
    ) -> Result<Box<dyn BrokerChannel>, RelayError> {
        let mut state = lock(&self.state);
        if state.disconnected {
            if state.refused_reconnects > 0 {
                state.refused_reconnects -= 1;
                return Err(RelayError::broker_unavailable(
                    "Failed to connect to broker",
                    "connection refused",
                ));
            }
            state.disconnected = false;
            state.reconnects += 1;
        }
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(RelayError::broker_unavailable(
                format!("Failed to open channel #{id}"),
                "connection refused",
            ));
        }
        state.opened.push(id);
        let script = state
            .scripts
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        Ok(Box::new(MockChannel {
            id,
            script,
            tracker,
            state: self.state.clone(),
            generation: state.generation,
            open: true,
            stalled: false,
        }))
    }

    fn channel_max(&self) -> u16 {
        lock(&self.state).channel_max
    }

    fn is_blocked(&self) -> bool {
        lock(&self.state).blocked
    }
}

struct MockChannel {
    id: u16,
    script: ChannelScript,
    tracker: ConfirmTracker,
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
    open: bool,
    stalled: bool,
}

impl MockChannel {
    fn connection_lost(&self) -> bool {
        lock(&self.state).generation != self.generation
    }

    fn shut(&mut self) {
        self.open = false;
        self.tracker.close();
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn publish(
        &mut self,
        route: &Route,
        message: &Message,
        tag: u64,
    ) -> Result<(), RelayError> {
        if self.open && self.connection_lost() {
            self.shut();
        }
        if !self.open {
            return Err(RelayError::ChannelClosed {
                channel: self.id,
                pending: self.tracker.pending(),
            });
        }
        if self.script.fail_publish_at == Some(tag) {
            self.shut();
            return Err(RelayError::ChannelClosed {
                channel: self.id,
                pending: self.tracker.pending(),
            });
        }

        {
            let mut state = lock(&self.state);
            state.published.push(Published {
                channel_id: self.id,
                tag,
                route: route.clone(),
                message: message.clone(),
            });
            if self.script.block_at == Some(tag) {
                state.blocked = true;
                self.stalled = true;
            }
            if let Some((at, refused)) = self.script.drop_connection_at {
                if at == tag {
                    state.drop_connection(refused);
                }
            }
        }

        if self.connection_lost() {
            self.shut();
            return Ok(());
        }
        if self.script.close_at == Some(tag) {
            self.shut();
            return Ok(());
        }
        if self.stalled {
            return Ok(());
        }
        if self.script.multiple_acks.contains(&tag) {
            self.tracker.ack(tag, true);
        } else if self.script.nacks.contains(&tag) {
            self.tracker.nack(tag, false);
        } else if !self.script.silent {
            self.tracker.ack(tag, false);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && !self.connection_lost()
    }
}
