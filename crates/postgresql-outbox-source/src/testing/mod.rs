//! Testing utilities for the PostgreSQL outbox source
//!
//! This module provides Docker container management for PostgreSQL testing.

pub mod container;

pub use container::PostgresContainer;
