//! Configuration for outbox consumers
//!
//! Configuration is a flat option record per backend; every field can be set
//! directly and the constructors only fill in defaults. Validation happens
//! once, on `start`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::{OutboxError, OutboxResult};
use crate::publish::PublishHandler;

/// The partition used when the caller does not name one.
pub const DEFAULT_PARTITION_KEY: &str = "default";

/// Injectable wall clock.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Error-sink callback invoked by background tasks.
pub type ErrorCallback = Arc<dyn Fn(&OutboxError) + Send + Sync>;

fn wall_clock() -> Clock {
    Arc::new(Utc::now)
}

fn no_op_error_sink() -> ErrorCallback {
    Arc::new(|_| {})
}

/// Connection parameters for the log-streaming (PostgreSQL) backend.
///
/// Used both for the query connection (driver-managed) and for the dedicated
/// streaming replication session.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
}

impl ConnectionOptions {
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname);
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

/// Connection parameters for the change-feed (MongoDB) backend.
#[derive(Debug, Clone)]
pub struct MongoConnectionOptions {
    pub uri: String,
    pub database: String,
}

/// Source of connection parameters, re-queried on every (re)connect so hosts
/// can rotate credentials without restarting the consumer.
pub type ConnectionSource = Arc<dyn Fn() -> ConnectionOptions + Send + Sync>;

/// Source of connection parameters for the document backend.
pub type MongoConnectionSource = Arc<dyn Fn() -> MongoConnectionOptions + Send + Sync>;

/// Options for the auxiliary polling outbox.
#[derive(Debug, Clone)]
pub struct AuxiliaryOptions {
    /// How often the polling loop wakes up
    pub check_interval: Duration,
    /// Maximum undelivered rows fetched per tick
    pub batch_limit: i64,
    /// Delay before a failed row is eligible again
    pub wait_after_failed_publish: Duration,
}

impl Default for AuxiliaryOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            batch_limit: 10,
            wait_after_failed_publish: Duration::from_secs(1),
        }
    }
}

/// Options for a log-streaming backend consumer.
#[derive(Clone)]
pub struct PgConsumerOptions {
    /// Consumer identity; becomes part of the slot and publication names
    pub consumer_name: String,
    /// Logical partition this consumer owns
    pub partition_key: String,
    /// Callback invoked with each delivered transaction batch
    pub publish: Arc<dyn PublishHandler>,
    /// Source of database connection parameters
    pub get_connection_options: ConnectionSource,
    /// Retry delay after the publish callback fails
    pub wait_after_failed_publish: Duration,
    /// `true` forces the strictly serialized publishing queue
    pub serialization: bool,
    /// Outstanding-publish bound for the pipelined queue
    pub max_in_flight: usize,
    /// Stamp a delivery timestamp on primary outbox rows after acknowledgement
    pub save_timestamps: bool,
    /// Stop the consumer automatically on the host's termination signal
    pub dispose_on_signal: bool,
    /// Error sink for failed publish attempts
    pub on_failed_publish: ErrorCallback,
    /// Error sink for storage errors hit by background tasks
    pub on_db_error: ErrorCallback,
    /// Clock injection
    pub now: Clock,
    /// Enable the auxiliary polling outbox
    pub auxiliary: Option<AuxiliaryOptions>,
    /// Cadence of unsolicited standby status updates (at most 10 s)
    pub status_interval: Duration,
}

impl PgConsumerOptions {
    pub fn new(
        consumer_name: impl Into<String>,
        connection: ConnectionOptions,
        publish: impl PublishHandler + 'static,
    ) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            partition_key: DEFAULT_PARTITION_KEY.to_string(),
            publish: Arc::new(publish),
            get_connection_options: Arc::new(move || connection.clone()),
            wait_after_failed_publish: Duration::from_secs(30),
            serialization: false,
            max_in_flight: 16,
            save_timestamps: false,
            dispose_on_signal: true,
            on_failed_publish: no_op_error_sink(),
            on_db_error: no_op_error_sink(),
            now: wall_clock(),
            auxiliary: None,
            status_interval: Duration::from_secs(10),
        }
    }

    pub(crate) fn validate(&self) -> OutboxResult<()> {
        validate_identity(&self.consumer_name, &self.partition_key)?;
        if self.max_in_flight == 0 {
            return Err(OutboxError::config("max_in_flight must be at least 1"));
        }
        if self.status_interval > Duration::from_secs(10) {
            return Err(OutboxError::config(
                "status_interval must not exceed 10 seconds",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PgConsumerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConsumerOptions")
            .field("consumer_name", &self.consumer_name)
            .field("partition_key", &self.partition_key)
            .field("wait_after_failed_publish", &self.wait_after_failed_publish)
            .field("serialization", &self.serialization)
            .field("max_in_flight", &self.max_in_flight)
            .field("save_timestamps", &self.save_timestamps)
            .field("dispose_on_signal", &self.dispose_on_signal)
            .field("auxiliary", &self.auxiliary)
            .field("status_interval", &self.status_interval)
            .finish_non_exhaustive()
    }
}

/// Options for a change-feed backend consumer.
#[derive(Clone)]
pub struct MongoConsumerOptions {
    pub consumer_name: String,
    pub partition_key: String,
    pub publish: Arc<dyn PublishHandler>,
    pub get_connection_options: MongoConnectionSource,
    pub wait_after_failed_publish: Duration,
    pub serialization: bool,
    pub max_in_flight: usize,
    pub dispose_on_signal: bool,
    pub on_failed_publish: ErrorCallback,
    pub on_db_error: ErrorCallback,
    pub now: Clock,
    pub auxiliary: Option<AuxiliaryOptions>,
}

impl MongoConsumerOptions {
    pub fn new(
        consumer_name: impl Into<String>,
        connection: MongoConnectionOptions,
        publish: impl PublishHandler + 'static,
    ) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            partition_key: DEFAULT_PARTITION_KEY.to_string(),
            publish: Arc::new(publish),
            get_connection_options: Arc::new(move || connection.clone()),
            wait_after_failed_publish: Duration::from_secs(30),
            serialization: false,
            max_in_flight: 16,
            dispose_on_signal: true,
            on_failed_publish: no_op_error_sink(),
            on_db_error: no_op_error_sink(),
            now: wall_clock(),
            auxiliary: None,
        }
    }

    pub(crate) fn validate(&self) -> OutboxResult<()> {
        validate_identity(&self.consumer_name, &self.partition_key)?;
        if self.max_in_flight == 0 {
            return Err(OutboxError::config("max_in_flight must be at least 1"));
        }
        Ok(())
    }
}

impl fmt::Debug for MongoConsumerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoConsumerOptions")
            .field("consumer_name", &self.consumer_name)
            .field("partition_key", &self.partition_key)
            .field("wait_after_failed_publish", &self.wait_after_failed_publish)
            .field("serialization", &self.serialization)
            .field("max_in_flight", &self.max_in_flight)
            .field("dispose_on_signal", &self.dispose_on_signal)
            .field("auxiliary", &self.auxiliary)
            .finish_non_exhaustive()
    }
}

fn validate_identity(consumer_name: &str, partition_key: &str) -> OutboxResult<()> {
    if consumer_name.trim().is_empty() {
        return Err(OutboxError::config("consumer name cannot be empty"));
    }
    if partition_key.trim().is_empty() {
        return Err(OutboxError::config("partition key cannot be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;

    fn noop_publish() -> impl PublishHandler {
        |_: Vec<Envelope>| async { anyhow::Ok(()) }
    }

    fn connection() -> ConnectionOptions {
        ConnectionOptions {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: None,
            dbname: "app".into(),
        }
    }

    #[test]
    fn defaults_match_the_documented_table() {
        let options = PgConsumerOptions::new("orders", connection(), noop_publish());
        assert_eq!(options.partition_key, DEFAULT_PARTITION_KEY);
        assert_eq!(options.wait_after_failed_publish, Duration::from_secs(30));
        assert!(!options.serialization);
        assert!(!options.save_timestamps);
        assert!(options.dispose_on_signal);
        assert!(options.auxiliary.is_none());
        assert_eq!(options.max_in_flight, 16);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn empty_consumer_name_is_rejected() {
        let options = PgConsumerOptions::new("  ", connection(), noop_publish());
        assert!(options.validate().is_err());
    }

    #[test]
    fn status_interval_is_capped_at_ten_seconds() {
        let mut options = PgConsumerOptions::new("orders", connection(), noop_publish());
        options.status_interval = Duration::from_secs(30);
        assert!(options.validate().is_err());
    }

    #[test]
    fn auxiliary_defaults() {
        let aux = AuxiliaryOptions::default();
        assert_eq!(aux.check_interval, Duration::from_secs(15));
        assert_eq!(aux.batch_limit, 10);
        assert_eq!(aux.wait_after_failed_publish, Duration::from_secs(1));
    }
}
