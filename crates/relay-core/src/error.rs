//! Error taxonomy of the relay.

use thiserror::Error;

/// Boxed cause carried by environment-level errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while dequeuing, publishing or confirming.
///
/// Message-level failures (`SourceContention`, `PublishRejected`,
/// `ConfirmTimeout`, `ChannelClosed`) are retried once from the held batch.
/// Environment-level failures always escalate to the critical-error backoff.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Network or authentication failure against the source database.
    #[error("Source database unavailable: {context}")]
    SourceUnavailable {
        context: String,
        #[source]
        source: BoxError,
    },

    /// Lock or statement timeout while dequeuing; treated as zero rows.
    #[error("Source contention: {context}")]
    SourceContention {
        context: String,
        #[source]
        source: BoxError,
    },

    /// Broker connection or channel creation failure.
    #[error("Broker unavailable: {context}")]
    BrokerUnavailable {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The broker negatively acknowledged a delivery.
    #[error("Channel #{channel}: publish rejected starting at delivery tag {first_failed_seq}")]
    PublishRejected { channel: u16, first_failed_seq: u64 },

    /// No confirmation arrived in time; broker state is unknown.
    #[error("Channel #{channel}: {pending} publisher confirms not received in time")]
    ConfirmTimeout { channel: u16, pending: u64 },

    /// The channel closed before all pending confirms arrived.
    #[error("Channel #{channel} closed with {pending} publisher confirms pending")]
    ChannelClosed { channel: u16, pending: u64 },

    /// Broker-side flow control blocked the connection.
    #[error("Broker connection is blocked (flow control)")]
    ConnectionBlocked,

    /// A source row could not be decoded into a message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Startup validation failure.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RelayError {
    pub fn source_unavailable(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RelayError::SourceUnavailable {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn source_contention(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RelayError::SourceContention {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn broker_unavailable(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RelayError::BrokerUnavailable {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Environment-level failures that skip the in-memory retry.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            RelayError::SourceUnavailable { .. }
                | RelayError::BrokerUnavailable { .. }
                | RelayError::ConnectionBlocked
        )
    }
}

/// Render an error with its full cause chain, `outer: inner: root`.
pub fn report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        cause = inner.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environmental_classification() {
        assert!(RelayError::source_unavailable("connect", "refused").is_environmental());
        assert!(RelayError::broker_unavailable("open channel", "closed").is_environmental());
        assert!(RelayError::ConnectionBlocked.is_environmental());
        assert!(!RelayError::source_contention("dequeue", "timeout").is_environmental());
        assert!(!RelayError::PublishRejected {
            channel: 1,
            first_failed_seq: 4
        }
        .is_environmental());
        assert!(!RelayError::ConfirmTimeout {
            channel: 1,
            pending: 2
        }
        .is_environmental());
    }

    #[test]
    fn test_report_includes_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = RelayError::source_unavailable("Failed to connect to localhost:5432", io);
        assert_eq!(
            report(&err),
            "Source database unavailable: Failed to connect to localhost:5432: connection refused"
        );
    }
}
