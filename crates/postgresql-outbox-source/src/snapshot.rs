//! Point-in-time snapshot of the outbox for bulk export.
//!
//! The snapshot table numbers every row by sequence order, which lets
//! export workers read disjoint row-number ranges while writers keep
//! appending to the live table.

use async_trait::async_trait;
use relay_core::{
    quote_ident, validate_table_name, ColumnMapping, Message, RelayError, RowRange,
    SnapshotReader, SnapshotSource,
};
use tokio_postgres::Client;
use tracing::{error, info};

use crate::client::connect;
use crate::row::{decode_row, split_decoded};

pub fn create_snapshot_sql(source: &str, snapshot: &str, columns: &ColumnMapping) -> String {
    let source = quote_ident(source);
    let snapshot = quote_ident(snapshot);
    format!(
        "DROP TABLE IF EXISTS {snapshot}; \
         CREATE TABLE {snapshot} AS \
         SELECT row_number() OVER (ORDER BY {sequence}) AS row_number, {list} FROM {source}; \
         ALTER TABLE {snapshot} ADD PRIMARY KEY (row_number)",
        sequence = quote_ident(&columns.sequence),
        list = columns.select_list(None),
    )
}

pub fn read_range_sql(snapshot: &str, columns: &ColumnMapping) -> String {
    format!(
        "SELECT {list} FROM {snapshot} WHERE row_number BETWEEN $1 AND $2 ORDER BY row_number",
        list = columns.select_list(None),
        snapshot = quote_ident(snapshot),
    )
}

/// A materialized, row-numbered copy of an outbox table.
pub struct PgSnapshot {
    conn: String,
    client: Client,
    table: String,
    read_sql: String,
}

impl PgSnapshot {
    /// Copy `source` into `snapshot`, replacing any previous snapshot.
    pub async fn create(
        conn: &str,
        source: &str,
        snapshot: &str,
        columns: &ColumnMapping,
    ) -> Result<Self, RelayError> {
        validate_table_name(source)?;
        validate_table_name(snapshot)?;
        columns.validate()?;

        let client = connect(conn).await?;

        let exists: bool = client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&quote_ident(source)])
            .await
            .map_err(|e| RelayError::source_unavailable("Failed to look up source table", e))?
            .get(0);
        if !exists {
            return Err(RelayError::Configuration(format!(
                "Source table '{source}' does not exist"
            )));
        }

        client
            .batch_execute(&create_snapshot_sql(source, snapshot, columns))
            .await
            .map_err(|e| {
                RelayError::source_unavailable(format!("Failed to create snapshot '{snapshot}'"), e)
            })?;
        info!("Created snapshot '{snapshot}' of '{source}'");

        Ok(Self {
            conn: conn.to_string(),
            client,
            table: snapshot.to_string(),
            read_sql: read_range_sql(snapshot, columns),
        })
    }

    pub async fn drop_snapshot(&self) -> Result<(), RelayError> {
        self.client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&self.table)))
            .await
            .map_err(|e| {
                RelayError::source_unavailable(format!("Failed to drop snapshot '{}'", self.table), e)
            })?;
        info!("Dropped snapshot '{}'", self.table);
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for PgSnapshot {
    async fn max_row_number(&self) -> Result<i64, RelayError> {
        let row = self
            .client
            .query_one(
                &format!(
                    "SELECT COALESCE(MAX(row_number), 0)::bigint FROM {}",
                    quote_ident(&self.table)
                ),
                &[],
            )
            .await
            .map_err(|e| RelayError::source_unavailable("Failed to count snapshot rows", e))?;
        Ok(row.get(0))
    }

    async fn reader(&self) -> Result<Box<dyn SnapshotReader>, RelayError> {
        Ok(Box::new(PgSnapshotReader {
            client: connect(&self.conn).await?,
            sql: self.read_sql.clone(),
        }))
    }
}

/// One export worker's connection to the snapshot.
pub struct PgSnapshotReader {
    client: Client,
    sql: String,
}

#[async_trait]
impl SnapshotReader for PgSnapshotReader {
    async fn read_range(&mut self, range: RowRange) -> Result<Vec<Message>, RelayError> {
        let rows = self
            .client
            .query(&self.sql, &[&range.first, &range.last])
            .await
            .map_err(|e| {
                RelayError::source_unavailable(format!("Failed to read snapshot rows {range}"), e)
            })?;
        let (messages, undecodable) = split_decoded(rows.iter().map(decode_row));
        for bad in &undecodable {
            error!(range = %range, "Skipping undecodable snapshot {bad}");
        }
        Ok(messages)
    }
}
