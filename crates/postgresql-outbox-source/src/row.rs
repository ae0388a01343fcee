//! Decoding of outbox rows into messages.
//!
//! Columns arrive in the fixed order of [`ColumnMapping::columns`]:
//! sequence, uuid, message type, operation type, body, timestamp.
//!
//! [`ColumnMapping::columns`]: relay_core::ColumnMapping::columns

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use relay_core::{Message, OperationType, RelayError};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::Row;
use uuid::Uuid;

const SEQUENCE: usize = 0;
const UUID: usize = 1;
const MESSAGE_TYPE: usize = 2;
const OPERATION_TYPE: usize = 3;
const BODY: usize = 4;
const TIMESTAMP: usize = 5;

/// A returned row that cannot be turned into a message, with whatever
/// identity could still be read from it.
#[derive(Debug)]
pub struct UndecodableRow {
    pub sequence_key: Option<i64>,
    pub uuid: Option<Uuid>,
    pub error: RelayError,
}

impl fmt::Display for UndecodableRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence_key {
            Some(seq) => write!(f, "row {seq}")?,
            None => f.write_str("row ?")?,
        }
        if let Some(uuid) = self.uuid {
            write!(f, " ({uuid})")?;
        }
        write!(f, ": {}", self.error)
    }
}

/// Decode a row, keeping its identity when decoding fails.
pub fn decode_row(row: &Row) -> Result<Message, UndecodableRow> {
    decode_message(row).map_err(|error| UndecodableRow {
        sequence_key: decode_sequence(row).ok(),
        uuid: decode_uuid(row).ok(),
        error,
    })
}

/// Separate decoded messages from rows that cannot be relayed.
pub fn split_decoded(
    rows: impl IntoIterator<Item = Result<Message, UndecodableRow>>,
) -> (Vec<Message>, Vec<UndecodableRow>) {
    let mut messages = Vec::new();
    let mut undecodable = Vec::new();
    for row in rows {
        match row {
            Ok(message) => messages.push(message),
            Err(bad) => undecodable.push(bad),
        }
    }
    (messages, undecodable)
}

pub fn decode_message(row: &Row) -> Result<Message, RelayError> {
    let sequence_key = decode_sequence(row)?;
    let uuid = decode_uuid(row)?;
    let message_type: Option<String> = get(row, MESSAGE_TYPE)?;
    let operation_type: Option<String> = get(row, OPERATION_TYPE)?;
    let operation_type = OperationType::from_column(operation_type.as_deref());
    let body: Option<String> = get(row, BODY)?;

    Ok(Message {
        sequence_key,
        uuid,
        message_type: message_type.unwrap_or_default(),
        operation_type,
        body: body.unwrap_or_default(),
        timestamp: decode_timestamp(row, sequence_key)?,
    })
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<T, RelayError> {
    row.try_get(idx)
        .map_err(|e| RelayError::InvalidMessage(format!("column {idx}: {e}")))
}

fn column_type(row: &Row, idx: usize) -> Result<&Type, RelayError> {
    row.columns()
        .get(idx)
        .map(|c| c.type_())
        .ok_or_else(|| RelayError::InvalidMessage(format!("row has no column {idx}")))
}

fn decode_sequence(row: &Row) -> Result<i64, RelayError> {
    let ty = column_type(row, SEQUENCE)?;
    if *ty == Type::INT2 {
        get::<i16>(row, SEQUENCE).map(i64::from)
    } else if *ty == Type::INT4 {
        get::<i32>(row, SEQUENCE).map(i64::from)
    } else {
        get::<i64>(row, SEQUENCE)
    }
}

fn decode_uuid(row: &Row) -> Result<Uuid, RelayError> {
    let ty = column_type(row, UUID)?;
    if *ty == Type::UUID {
        get(row, UUID)
    } else if *ty == Type::BYTEA {
        uuid_from_bytes(&get::<Vec<u8>>(row, UUID)?)
    } else {
        uuid_from_text(&get::<String>(row, UUID)?)
    }
}

fn decode_timestamp(row: &Row, sequence_key: i64) -> Result<DateTime<Utc>, RelayError> {
    let timestamp = if *column_type(row, TIMESTAMP)? == Type::TIMESTAMP {
        get::<Option<NaiveDateTime>>(row, TIMESTAMP)?.map(|t| t.and_utc())
    } else {
        get::<Option<DateTime<Utc>>>(row, TIMESTAMP)?
    };
    timestamp.ok_or_else(|| {
        RelayError::InvalidMessage(format!("row {sequence_key}: timestamp is NULL"))
    })
}

/// A 16-byte binary identifier.
pub fn uuid_from_bytes(bytes: &[u8]) -> Result<Uuid, RelayError> {
    Uuid::from_slice(bytes).map_err(|e| {
        RelayError::InvalidMessage(format!("uuid column holds {} bytes: {e}", bytes.len()))
    })
}

pub fn uuid_from_text(text: &str) -> Result<Uuid, RelayError> {
    Uuid::parse_str(text.trim())
        .map_err(|e| RelayError::InvalidMessage(format!("invalid uuid '{text}': {e}")))
}
