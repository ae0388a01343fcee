//! Idle wait on `LISTEN`/`NOTIFY`.
//!
//! The outbox table carries a statement-level trigger calling `pg_notify`
//! (see [`crate::setup`]). A dedicated connection listens on the channel;
//! notifications received while the relay is busy stay queued, so a wakeup
//! is never lost between two waits.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use relay_core::{quote_ident, IdleNotifier, RelayError, WaitOutcome};
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, info, warn};

use crate::client::sanitize_connection_string;

struct Listener {
    // Keeps the connection open.
    _client: Client,
    notifications: mpsc::UnboundedReceiver<()>,
}

pub struct PgNotifier {
    conn: String,
    channel: String,
    listener: Option<Listener>,
    not_supported: bool,
}

impl PgNotifier {
    pub fn new(conn: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            conn: conn.into(),
            channel: channel.into(),
            listener: None,
            not_supported: false,
        }
    }

    async fn listen(&self) -> Result<Listener, tokio_postgres::Error> {
        let (client, mut connection) = tokio_postgres::connect(&self.conn, NoTls).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) if n.channel() == channel => {
                        if tx.send(()).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!("Notice on notification connection: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Notification connection error: {e}");
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", quote_ident(&self.channel)))
            .await?;

        Ok(Listener {
            _client: client,
            notifications: rx,
        })
    }
}

#[async_trait]
impl IdleNotifier for PgNotifier {
    async fn await_work(&mut self, timeout: Duration) -> Result<WaitOutcome, RelayError> {
        if self.not_supported {
            return Ok(WaitOutcome::NotSupported);
        }

        let mut listener = match self.listener.take() {
            Some(listener) => listener,
            None => match self.listen().await {
                Ok(listener) => {
                    info!("Listening for outbox notifications on '{}'", self.channel);
                    listener
                }
                Err(e) if e.code() == Some(&SqlState::FEATURE_NOT_SUPPORTED) => {
                    warn!("Server does not support LISTEN, falling back to polling: {e}");
                    self.not_supported = true;
                    return Ok(WaitOutcome::NotSupported);
                }
                Err(e) => {
                    return Err(RelayError::source_unavailable(
                        format!(
                            "Failed to listen for notifications on {}",
                            sanitize_connection_string(&self.conn)
                        ),
                        e,
                    ))
                }
            },
        };

        let outcome = match tokio::time::timeout(timeout, listener.notifications.recv()).await {
            Ok(Some(())) => {
                // One wakeup covers every row inserted so far.
                while listener.notifications.try_recv().is_ok() {}
                WaitOutcome::NotificationReceived
            }
            Ok(None) => {
                return Err(RelayError::source_unavailable(
                    "Notification connection lost",
                    "connection closed",
                ))
            }
            Err(_) => WaitOutcome::TimedOut,
        };

        self.listener = Some(listener);
        Ok(outcome)
    }
}
