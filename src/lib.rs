//! Hermes — transactional-outbox runtime
//!
//! Messages enqueued inside an application's database transaction are
//! delivered at-least-once to a publish callback, with the enqueue atomic
//! with the business write. Two storage backends exist: PostgreSQL logical
//! replication ([`pg::PgOutboxConsumer`]) and MongoDB change streams
//! ([`mongo::MongoOutboxConsumer`]); both offer an auxiliary polling queue
//! for non-critical traffic.
//!
//! Within a partition, transaction batches reach the callback in commit
//! order and the acknowledged position advances monotonically without gaps.
//! Delivery is at-least-once: the callback must tolerate duplicate
//! invocations for the same `message_id`.
//!
//! ```no_run
//! use hermes::{ConnectionOptions, Envelope, Message, PgConsumerOptions, PgOutboxConsumer};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let connection = ConnectionOptions {
//!     host: "localhost".into(),
//!     port: 5432,
//!     user: "postgres".into(),
//!     password: None,
//!     dbname: "app".into(),
//! };
//! let options = PgConsumerOptions::new("orders", connection, |batch: Vec<Envelope>| async move {
//!     for message in &batch {
//!         println!("delivering {} ({})", message.message_id, message.message_type);
//!     }
//!     Ok(())
//! });
//!
//! let consumer = PgOutboxConsumer::new(options)?;
//! let stop = consumer.start().await?;
//!
//! consumer
//!     .enqueue_one(Message::new("order-1-placed", "OrderPlaced", json!({ "total": 12 })))
//!     .await?;
//!
//! stop.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod auxiliary;
pub mod config;
pub mod errors;
pub mod lsn;
pub mod message;
pub mod mongo;
pub mod pg;
pub mod protocol;
pub mod publish;

mod signal;

pub use auxiliary::{AuxiliaryRow, AuxiliaryStore};
pub use config::{
    AuxiliaryOptions, Clock, ConnectionOptions, DEFAULT_PARTITION_KEY, ErrorCallback,
    MongoConnectionOptions, MongoConsumerOptions, PgConsumerOptions,
};
pub use errors::{OutboxError, OutboxResult};
pub use lsn::Lsn;
pub use message::{Envelope, Message, TransactionBatch};
pub use mongo::consumer::{MongoEnqueueOptions, MongoSendOptions};
pub use mongo::{MongoOutboxConsumer, MongoStopHandle};
pub use pg::consumer::{EnqueueOptions, SendOptions};
pub use pg::{PgOutboxConsumer, StopHandle};
pub use publish::{DeliveryOutcome, PublishHandler};
