//! Transactional dequeue from the outbox table.

use std::time::Duration;

use async_trait::async_trait;
use relay_core::{
    quote_ident, report, validate_table_name, ColumnMapping, Dequeued, OutboxSource, RelayError,
};
use tokio_postgres::{Client, Row};
use tracing::{debug, error, warn};

use crate::client::{classify, connect, sanitize_connection_string};
use crate::row::{decode_row, split_decoded};

/// Delete-and-return the oldest `$1` unlocked rows in one statement.
///
/// Rows locked by a concurrent dequeue are skipped rather than waited on.
pub fn dequeue_statement(table: &str, columns: &ColumnMapping) -> String {
    let table = quote_ident(table);
    let sequence = quote_ident(&columns.sequence);
    format!(
        "WITH batch AS (\
            SELECT {sequence} FROM {table} \
            ORDER BY {sequence} \
            LIMIT $1 \
            FOR UPDATE SKIP LOCKED\
        ) \
        DELETE FROM {table} AS t USING batch \
        WHERE t.{sequence} = batch.{sequence} \
        RETURNING {returning}",
        returning = columns.select_list(Some("t")),
    )
}

/// Outbox accessor holding one connection and at most one open transaction.
///
/// The connection is opened lazily and dropped after any failure that is not
/// lock contention, so the next dequeue starts on a fresh one.
pub struct PgOutboxSource {
    conn: String,
    statement: String,
    command_timeout: Duration,
    client: Option<Client>,
    in_transaction: bool,
}

impl PgOutboxSource {
    pub fn new(
        conn: impl Into<String>,
        table: &str,
        columns: &ColumnMapping,
        command_timeout: Duration,
    ) -> Result<Self, RelayError> {
        validate_table_name(table)?;
        columns.validate()?;
        Ok(Self {
            conn: conn.into(),
            statement: dequeue_statement(table, columns),
            command_timeout,
            client: None,
            in_transaction: false,
        })
    }

    async fn take_client(&mut self) -> Result<Client, RelayError> {
        match self.client.take() {
            Some(client) if !client.is_closed() => Ok(client),
            _ => {
                debug!(
                    "Opening outbox connection to {}",
                    sanitize_connection_string(&self.conn)
                );
                connect(&self.conn).await
            }
        }
    }

    async fn begin_and_dequeue(
        &self,
        client: &Client,
        max_count: usize,
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        client
            .batch_execute(&format!(
                "BEGIN; SET LOCAL statement_timeout = {}",
                self.command_timeout.as_millis()
            ))
            .await?;
        client
            .query(&self.statement, &[&(max_count as i64)])
            .await
    }

    /// Resolve the open transaction with `command`, keeping the connection on success.
    async fn finish(&mut self, command: &str) -> Result<(), RelayError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        // A new connection would not see the transaction.
        let Some(client) = self.client.take() else {
            return Err(RelayError::source_unavailable(
                format!("Failed to {} outbox transaction", command.to_lowercase()),
                "connection lost",
            ));
        };
        let result = client.batch_execute(command).await;
        match result {
            Ok(()) => {
                self.client = Some(client);
                Ok(())
            }
            Err(e) => Err(RelayError::source_unavailable(
                format!("Failed to {} outbox transaction", command.to_lowercase()),
                e,
            )),
        }
    }
}

#[async_trait]
impl OutboxSource for PgOutboxSource {
    async fn dequeue_batch(&mut self, max_count: usize) -> Result<Dequeued, RelayError> {
        if self.in_transaction {
            warn!("Rolling back an unresolved outbox transaction before dequeuing");
            self.finish("ROLLBACK").await?;
        }

        let client = self.take_client().await?;
        let rows = match self.begin_and_dequeue(&client, max_count).await {
            Ok(rows) => rows,
            Err(e) => {
                let err = classify("Failed to dequeue outbox batch", e);
                if matches!(err, RelayError::SourceContention { .. }) {
                    let rolled_back = client.batch_execute("ROLLBACK").await;
                    match rolled_back {
                        Ok(()) => self.client = Some(client),
                        Err(e) => warn!("Failed to roll back after contention: {e}"),
                    }
                }
                return Err(err);
            }
        };

        // Undecodable rows are deleted with the batch rather than blocking it.
        let (mut messages, undecodable) = split_decoded(rows.iter().map(decode_row));
        for bad in &undecodable {
            error!(
                seq = ?bad.sequence_key,
                uuid = ?bad.uuid,
                error = %report(&bad.error),
                "Quarantining undecodable outbox row"
            );
        }
        // RETURNING order is unspecified.
        messages.sort_by_key(|m| m.sequence_key);

        if messages.is_empty() {
            client
                .batch_execute("COMMIT")
                .await
                .map_err(|e| classify("Failed to close empty dequeue", e))?;
            self.client = Some(client);
            return Ok(Dequeued {
                messages,
                rows_affected: rows.len() as u64,
            });
        }

        debug!(
            rows = messages.len(),
            first = messages[0].sequence_key,
            "Dequeued outbox batch"
        );
        self.client = Some(client);
        self.in_transaction = true;
        Ok(Dequeued {
            rows_affected: rows.len() as u64,
            messages,
        })
    }

    async fn commit(&mut self) -> Result<(), RelayError> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), RelayError> {
        self.finish("ROLLBACK").await
    }
}
