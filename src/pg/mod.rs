//! Log-streaming backend on PostgreSQL logical replication
//!
//! The consumer owns two connections: a driver-managed query connection for
//! migrations, enqueues and the consumer-state row, and a dedicated streaming
//! replication session that decodes `pgoutput` into transaction batches.

pub mod connection;
pub mod consumer;
pub mod migrations;
pub mod replication;
pub mod store;

pub use consumer::{PgOutboxConsumer, StopHandle};

/// PostgreSQL identifier length limit
const MAX_IDENTIFIER_LEN: usize = 63;

/// Normalize a name component for use inside slot/publication identifiers.
///
/// Lowercased; anything outside `[a-z0-9_]` becomes `_`. Deterministic so
/// every process derives the same slot for the same consumer identity.
fn normalize_component(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Replication slot owned by one (consumer, partition) pair.
pub fn slot_name(consumer_name: &str, partition_key: &str) -> String {
    let mut name = format!(
        "hermes_{}_{}",
        normalize_component(consumer_name),
        normalize_component(partition_key)
    );
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

/// Publication covering the primary outbox, shared by a consumer's partitions.
pub fn publication_name(consumer_name: &str) -> String {
    let mut name = format!("hermes_{}", normalize_component(consumer_name));
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_name_is_deterministic_and_safe() {
        assert_eq!(slot_name("orders", "default"), "hermes_orders_default");
        assert_eq!(slot_name("Orders-API", "eu/west"), "hermes_orders_api_eu_west");
        assert_eq!(
            slot_name("orders", "default"),
            slot_name("orders", "default")
        );
    }

    #[test]
    fn slot_name_respects_identifier_limit() {
        let long = "x".repeat(100);
        assert!(slot_name(&long, &long).len() <= MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn publication_is_per_consumer() {
        assert_eq!(publication_name("Orders API"), "hermes_orders_api");
    }
}
