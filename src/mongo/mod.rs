//! Change-feed backend on MongoDB change streams
//!
//! Observes inserts to the primary outbox collection, scoped to one
//! partition, and emits single-row transaction batches. Positions are
//! allocated from a counters collection at enqueue time; resumability comes
//! from the change stream's resume token, persisted in the consumer-state
//! document.

pub mod change_stream;
pub mod consumer;
pub mod migrations;
pub mod store;

pub use consumer::{MongoOutboxConsumer, MongoStopHandle};

pub(crate) const OUTBOX_COLLECTION: &str = "outbox";
pub(crate) const AUX_COLLECTION: &str = "outbox_aux";
pub(crate) const STATE_COLLECTION: &str = "consumer_state";
pub(crate) const COUNTERS_COLLECTION: &str = "counters";

/// Counter scope for primary outbox positions of one partition.
pub(crate) fn outbox_counter_scope(partition_key: &str) -> String {
    format!("outbox:{partition_key}")
}

/// Counter scope for auxiliary outbox positions of one consumer.
pub(crate) fn aux_counter_scope(consumer_name: &str) -> String {
    format!("outbox_aux:{consumer_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_scopes_do_not_collide() {
        assert_ne!(outbox_counter_scope("a"), aux_counter_scope("a"));
        assert_eq!(outbox_counter_scope("eu"), "outbox:eu");
    }
}
