//! Outbox table and notification trigger DDL.

use relay_core::{quote_ident, validate_table_name, ColumnMapping, OperationType, RelayError};
use tokio_postgres::Client;
use tracing::info;

/// `CREATE TABLE IF NOT EXISTS` for an outbox with the mapped column names.
pub fn outbox_table_ddl(table: &str, columns: &ColumnMapping) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20   {sequence} BIGSERIAL PRIMARY KEY,\n\
         \x20   {uuid} UUID NOT NULL DEFAULT gen_random_uuid(),\n\
         \x20   {message_type} TEXT NOT NULL,\n\
         \x20   {operation_type} TEXT NOT NULL,\n\
         \x20   {body} TEXT NOT NULL DEFAULT '',\n\
         \x20   {timestamp} TIMESTAMPTZ NOT NULL DEFAULT now()\n\
         )",
        table = quote_ident(table),
        sequence = quote_ident(&columns.sequence),
        uuid = quote_ident(&columns.uuid),
        message_type = quote_ident(&columns.message_type),
        operation_type = quote_ident(&columns.operation_type),
        body = quote_ident(&columns.body),
        timestamp = quote_ident(&columns.timestamp),
    )
}

/// Statement-level `AFTER INSERT` trigger calling `pg_notify(channel)`.
pub fn notify_trigger_ddl(table: &str, channel: &str) -> String {
    let base = table.rsplit('.').next().unwrap_or(table);
    let function = quote_ident(&format!("{table}_notify"));
    let trigger = quote_ident(&format!("{base}_notify"));
    let channel = channel.replace('\'', "''");
    let table = quote_ident(table);
    format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS $$\n\
         BEGIN\n\
         \x20   PERFORM pg_notify('{channel}', '');\n\
         \x20   RETURN NULL;\n\
         END\n\
         $$;\n\
         DROP TRIGGER IF EXISTS {trigger} ON {table};\n\
         CREATE TRIGGER {trigger} AFTER INSERT ON {table} \
         FOR EACH STATEMENT EXECUTE FUNCTION {function}()"
    )
}

/// Create the outbox table and its notification trigger if absent.
pub async fn create_outbox(
    client: &Client,
    table: &str,
    columns: &ColumnMapping,
    channel: &str,
) -> Result<(), RelayError> {
    validate_table_name(table)?;
    columns.validate()?;

    client
        .batch_execute(&outbox_table_ddl(table, columns))
        .await
        .map_err(|e| RelayError::source_unavailable(format!("Failed to create table '{table}'"), e))?;
    client
        .batch_execute(&notify_trigger_ddl(table, channel))
        .await
        .map_err(|e| {
            RelayError::source_unavailable(format!("Failed to create trigger on '{table}'"), e)
        })?;

    info!("Outbox table '{table}' ready, notifying on '{channel}'");
    Ok(())
}

/// Append one row to the outbox and return its sequence key.
pub async fn insert_message(
    client: &Client,
    table: &str,
    columns: &ColumnMapping,
    message_type: &str,
    operation_type: OperationType,
    body: &str,
) -> Result<i64, RelayError> {
    let sql = format!(
        "INSERT INTO {} ({}, {}, {}) VALUES ($1, $2, $3) RETURNING {}",
        quote_ident(table),
        quote_ident(&columns.message_type),
        quote_ident(&columns.operation_type),
        quote_ident(&columns.body),
        quote_ident(&columns.sequence),
    );
    let row = client
        .query_one(&sql, &[&message_type, &operation_type.as_str(), &body])
        .await
        .map_err(|e| RelayError::source_unavailable("Failed to insert outbox row", e))?;
    Ok(row.get(0))
}
