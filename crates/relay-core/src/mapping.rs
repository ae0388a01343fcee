//! Logical field to physical column name mapping.
//!
//! The mapping is plain data, validated once at startup and handed to the
//! source accessor, which builds its SQL from it a single time.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::RelayError;

/// Physical column names of an outbox table, one per logical message field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnMapping {
    pub sequence: String,
    pub uuid: String,
    pub message_type: String,
    pub operation_type: String,
    pub body: String,
    pub timestamp: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            sequence: "sequence_key".to_string(),
            uuid: "uuid".to_string(),
            message_type: "message_type".to_string(),
            operation_type: "operation_type".to_string(),
            body: "body".to_string(),
            timestamp: "created_at".to_string(),
        }
    }
}

impl ColumnMapping {
    /// Columns in the fixed logical order used for row decoding:
    /// sequence, uuid, message type, operation type, body, timestamp.
    pub fn columns(&self) -> [&str; 6] {
        [
            &self.sequence,
            &self.uuid,
            &self.message_type,
            &self.operation_type,
            &self.body,
            &self.timestamp,
        ]
    }

    /// Reject empty, unquotable or duplicated column names.
    pub fn validate(&self) -> Result<(), RelayError> {
        let names = [
            ("sequence", &self.sequence),
            ("uuid", &self.uuid),
            ("message_type", &self.message_type),
            ("operation_type", &self.operation_type),
            ("body", &self.body),
            ("timestamp", &self.timestamp),
        ];

        let mut seen = HashSet::new();
        for (field, column) in names {
            validate_identifier(column)
                .map_err(|e| RelayError::Configuration(format!("column for '{field}': {e}")))?;
            if !seen.insert(column.as_str()) {
                return Err(RelayError::Configuration(format!(
                    "column '{column}' is mapped to more than one field"
                )));
            }
        }
        Ok(())
    }

    /// Comma-separated quoted column list, optionally qualified with `alias`.
    pub fn select_list(&self, alias: Option<&str>) -> String {
        self.columns()
            .iter()
            .map(|c| match alias {
                Some(a) => format!("{a}.{}", quote_ident(c)),
                None => quote_ident(c),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn validate_identifier(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("name is empty".to_string());
    }
    if name.contains('"') || name.contains('\0') {
        return Err(format!("name '{name}' contains a quote or NUL character"));
    }
    Ok(())
}

/// Validate a possibly schema-qualified table name.
pub fn validate_table_name(name: &str) -> Result<(), RelayError> {
    for part in name.split('.') {
        validate_identifier(part)
            .map_err(|e| RelayError::Configuration(format!("table '{name}': {e}")))?;
    }
    Ok(())
}

/// Quote an identifier, splitting `schema.table` into quoted parts.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}
