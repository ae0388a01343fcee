//! PostgreSQL outbox source for the outbox relay.
//!
//! - [`PgOutboxSource`]: deletes the oldest rows inside a transaction that
//!   stays open until the relay commits or rolls back
//! - [`PgNotifier`]: waits on `LISTEN`/`NOTIFY` between batches
//! - [`PgSnapshot`]: row-numbered copy of the outbox for bulk export
//! - [`setup`]: outbox table and trigger DDL

pub mod client;
pub mod notify;
pub mod queue;
pub mod row;
pub mod setup;
pub mod snapshot;
pub mod testing;

pub use client::{connect, sanitize_connection_string};
pub use notify::PgNotifier;
pub use queue::PgOutboxSource;
pub use setup::{create_outbox, insert_message};
pub use snapshot::{PgSnapshot, PgSnapshotReader};
