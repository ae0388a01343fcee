//! RabbitMQ publishing for the outbox relay.
//!
//! A [`ChannelPool`] owns a fixed set of confirm-mode channels on one
//! connection. Each dequeued batch is split by message type across the
//! channels ([`partition`]), every slice is published by its own task, and
//! each channel's [`ConfirmTracker`] decides whether the broker accepted it.
//!
//! The broker is reached through the [`BrokerConnection`] / [`BrokerChannel`]
//! traits: [`amqp`] implements them with `lapin`, [`testing`] in memory.

pub mod amqp;
pub mod channel;
pub mod pool;
pub mod route;
pub mod testing;
pub mod tracker;

pub use amqp::{exchange_kind, sanitize_amqp_uri, AmqpConnection, Credentials};
pub use channel::{BrokerChannel, BrokerConnection, ChannelReport, RelayChannel};
pub use pool::{partition, pool_size, watch_blocked, ChannelPool};
pub use route::{Binding, Route, RouteOverride, Router};
pub use tracker::{ConfirmOutcome, ConfirmTracker};
