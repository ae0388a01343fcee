//! Core types for the outbox relay.
//!
//! This crate provides the foundational pieces shared by the source
//! accessor, the publisher and the orchestrator:
//!
//! - [`Message`] / [`OperationType`] - one relayed outbox row
//! - [`BatchId`] / [`RowRange`] - batch identity
//! - [`RelayError`] - the relay error taxonomy
//! - [`ColumnMapping`] - logical field to physical column name mapping
//! - [`OutboxSource`], [`IdleNotifier`], [`SnapshotSource`] - source-side seams
//!
//! # Architecture
//!
//! ```text
//! relay-core (this crate)
//!    │
//!    ├─── outbox-relay-postgresql-source  (implements the source traits)
//!    ├─── outbox-relay-rabbitmq           (publishes Messages, tracks confirms)
//!    └─── outbox-relay                    (orchestrator, export, CLI)
//! ```

pub mod batch;
pub mod error;
pub mod mapping;
pub mod message;
pub mod source;
pub mod testing;

pub use batch::{BatchId, RowRange};
pub use error::{report, BoxError, RelayError};
pub use mapping::{quote_ident, validate_table_name, ColumnMapping};
pub use message::{Message, OperationType};
pub use source::{
    Dequeued, IdleNotifier, OutboxSource, SnapshotReader, SnapshotSource, WaitOutcome,
};
