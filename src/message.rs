//! Message envelopes flowing through the outbox
//!
//! `Message` is what the host enqueues; `Envelope` is what the publish
//! callback receives once the row has come back through the upstream log;
//! `TransactionBatch` groups the envelopes that were committed together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message to be enqueued into the outbox.
///
/// The message id is user-supplied and intended to be deterministic so that
/// consumers can deduplicate redeliveries. The payload is opaque JSON; the
/// engine never inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub message_type: String,
    pub data: serde_json::Value,
}

impl Message {
    pub fn new(
        message_id: impl Into<String>,
        message_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            message_type: message_type.into(),
            data,
        }
    }
}

/// A delivered message as handed to the publish callback.
///
/// Carries the storage-assigned position and the redelivery count for the
/// current attempt (0 on first delivery). Delivery is at-least-once: the
/// callback must tolerate duplicate invocations for the same `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonic per-partition position assigned by the storage engine
    pub position: i64,
    pub message_id: String,
    pub message_type: String,
    pub partition_key: String,
    /// Number of prior failed publish attempts for the containing batch
    pub redelivery_count: u32,
    /// Opaque token locating this message in the upstream log, when the
    /// delivery came through one (absent for the auxiliary polling outbox)
    pub source_position: Option<String>,
    pub data: serde_json::Value,
}

/// The ordered set of outbox rows that were committed together upstream.
///
/// Within a partition, batches are emitted in commit order and without gaps.
/// A batch with no envelopes never reaches the publish callback; it exists
/// only to advance the acknowledged position past foreign-partition commits.
#[derive(Debug, Clone)]
pub struct TransactionBatch {
    /// Upstream transaction id, where the source provides one
    pub transaction_id: Option<String>,
    /// Commit position used for ordering acknowledgements
    pub commit_position: u64,
    /// Opaque token for the commit location in the upstream log
    pub source_token: String,
    pub committed_at: Option<DateTime<Utc>>,
    pub messages: Vec<Envelope>,
}

impl TransactionBatch {
    /// Stamp every envelope in the batch with the current attempt count.
    pub(crate) fn set_redelivery_count(&mut self, count: u32) {
        for message in &mut self.messages {
            message.redelivery_count = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redelivery_count_is_stamped_on_every_envelope() {
        let mut batch = TransactionBatch {
            transaction_id: Some("771".into()),
            commit_position: 42,
            source_token: "0/16B3748".into(),
            committed_at: None,
            messages: vec![
                Envelope {
                    position: 1,
                    message_id: "m1".into(),
                    message_type: "X".into(),
                    partition_key: "default".into(),
                    redelivery_count: 0,
                    source_position: Some("0/16B3748".into()),
                    data: json!({"v": 1}),
                },
                Envelope {
                    position: 2,
                    message_id: "m2".into(),
                    message_type: "X".into(),
                    partition_key: "default".into(),
                    redelivery_count: 0,
                    source_position: Some("0/16B3748".into()),
                    data: json!({"v": 2}),
                },
            ],
        };

        batch.set_redelivery_count(3);
        assert!(batch.messages.iter().all(|m| m.redelivery_count == 3));
    }
}
