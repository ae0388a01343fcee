//! Testing utilities for the RabbitMQ publisher
//!
//! `mock` provides a scriptable in-memory broker; `container` manages a
//! RabbitMQ Docker container for the ignored integration tests.

pub mod container;
pub mod mock;

pub use container::RabbitMqContainer;
pub use mock::{ChannelScript, MockBroker, Published};
