//! Error types for the outbox runtime
//!
//! Provides structured error handling using thiserror. User-facing methods
//! (`enqueue`, `send`, `start`, `stop`) surface these directly; background
//! tasks report them through the configured error sinks instead of crashing.

use thiserror::Error;

/// Main error type for the outbox runtime
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The replication slot / partition is held by another live consumer
    #[error("consumer '{consumer_name}' already holds partition '{partition_key}'")]
    ConsumerAlreadyTaken {
        consumer_name: String,
        partition_key: String,
    },

    /// An API call arrived before `start` established a connection
    #[error("consumer is not started")]
    NotStarted,

    /// `send` was called but no auxiliary consumer was configured
    #[error("auxiliary outbox is not configured")]
    AuxiliaryNotConfigured,

    /// Insert/update/select against the storage engine failed
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The user publish callback returned an error
    #[error("publish callback failed")]
    Publish(#[source] anyhow::Error),

    /// Malformed replication frame or logical message; fatal to the stream session
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        context: Option<String>,
    },

    /// Upstream retention advanced past the stored resume token
    #[error("resume position is no longer available upstream: {token}")]
    PositionLost { token: String },

    /// The storage engine is too old for this backend
    #[error("unsupported server version: found {found}, required {required}")]
    NotSupportedVersion { found: String, required: String },

    /// Configuration related errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Network/IO related errors
    #[error("network IO error")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type OutboxResult<T> = std::result::Result<T, OutboxError>;

impl OutboxError {
    /// Create a storage error with a message only
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error wrapping a driver error
    pub fn storage_with<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            context: None,
        }
    }

    /// Create a protocol error with context
    pub fn protocol_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Protocol {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether reopening a stream session from the last acknowledged
    /// position can possibly succeed.
    ///
    /// Transport, storage and malformed-frame failures are fatal only to the
    /// current session; a slot held elsewhere, a lost resume position or a
    /// misconfiguration will fail the same way every time.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Io(_) | Self::Publish(_) | Self::Protocol { .. }
        )
    }
}

impl From<tokio_postgres::Error> for OutboxError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<mongodb::error::Error> for OutboxError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_helper_keeps_message() {
        let err = OutboxError::storage("insert failed");
        assert!(err.to_string().contains("insert failed"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn session_failures_are_recoverable_by_restart() {
        assert!(OutboxError::protocol("unknown frame byte").is_recoverable());
        assert!(OutboxError::storage("connection reset").is_recoverable());
    }

    #[test]
    fn held_slots_and_lost_positions_are_not_recoverable() {
        let taken = OutboxError::ConsumerAlreadyTaken {
            consumer_name: "orders".into(),
            partition_key: "default".into(),
        };
        assert!(!taken.is_recoverable());
        let lost = OutboxError::PositionLost {
            token: "t1".into(),
        };
        assert!(!lost.is_recoverable());
        assert!(!OutboxError::config("bad wal_level").is_recoverable());
    }
}
