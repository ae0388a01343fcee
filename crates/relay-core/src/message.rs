//! Outbox message model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RelayError;

/// Kind of change that produced an outbox row.
///
/// Carried to consumers in the `OperationType` message header. Values the
/// relay does not recognise are passed through unchanged as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    #[serde(untagged)]
    Other(String),
}

impl OperationType {
    /// Header value as written on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Other(raw) => raw,
        }
    }

    /// Operation type as stored in an outbox row. NULL becomes an empty
    /// header value; unknown names are kept verbatim.
    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            Some(raw) => raw
                .parse()
                .unwrap_or_else(|_| OperationType::Other(raw.to_string())),
            None => OperationType::Other(String::new()),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("INSERT") {
            Ok(OperationType::Insert)
        } else if s.eq_ignore_ascii_case("UPDATE") {
            Ok(OperationType::Update)
        } else if s.eq_ignore_ascii_case("DELETE") {
            Ok(OperationType::Delete)
        } else {
            Err(RelayError::InvalidMessage(format!(
                "unknown operation type: '{s}'"
            )))
        }
    }
}

/// One unit of relay: a row taken from the outbox.
///
/// The body is opaque to the relay; it is published byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic, source-assigned key. Defines dequeue order.
    pub sequence_key: i64,
    /// Stable identity, published as the broker message-id.
    pub uuid: Uuid,
    /// Routing and partition key.
    pub message_type: String,
    pub operation_type: OperationType,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh uuid, stamped now.
    pub fn new(
        sequence_key: i64,
        message_type: impl Into<String>,
        operation_type: OperationType,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sequence_key,
            uuid: Uuid::new_v4(),
            message_type: message_type.into(),
            operation_type,
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}
