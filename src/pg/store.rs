//! SQL access for the log-streaming backend
//!
//! Every statement the consumer runs against the query connection lives
//! here: outbox inserts, the consumer-state row, auxiliary polling and the
//! slot takeover used by `stop`. Table and column names follow the persisted
//! layout contract, so identifiers are quoted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, GenericClient};
use tracing::debug;

use crate::auxiliary::{AuxiliaryRow, AuxiliaryStore};
use crate::errors::{OutboxError, OutboxResult};
use crate::lsn::Lsn;
use crate::message::Message;

pub(crate) const SCHEMA: &str = "hermes";
pub(crate) const OUTBOX_TABLE: &str = "outbox";

fn columns(messages: &[Message]) -> (Vec<&str>, Vec<&str>, Vec<&serde_json::Value>) {
    let ids = messages.iter().map(|m| m.message_id.as_str()).collect();
    let types = messages.iter().map(|m| m.message_type.as_str()).collect();
    let payloads = messages.iter().map(|m| &m.data).collect();
    (ids, types, payloads)
}

/// Insert primary outbox rows, preserving the caller's message order.
///
/// A single statement keeps the insert atomic when no host transaction is
/// supplied, and the ordinality sort makes the storage engine assign
/// positions in message order. Runs on whatever client the caller supplies,
/// so a host transaction makes the enqueue atomic with the business write.
pub(crate) async fn insert_outbox_rows<C: GenericClient>(
    client: &C,
    partition_key: &str,
    messages: &[Message],
) -> OutboxResult<()> {
    let (ids, types, payloads) = columns(messages);
    client
        .execute(
            r#"INSERT INTO hermes.outbox ("messageId", "messageType", "partitionKey", "data")
               SELECT m.id, m.kind, $4, m.payload
               FROM unnest($1::text[], $2::text[], $3::jsonb[])
                    WITH ORDINALITY AS m(id, kind, payload, ord)
               ORDER BY m.ord"#,
            &[&ids, &types, &payloads, &partition_key],
        )
        .await?;
    debug!(count = messages.len(), partition_key, "outbox rows inserted");
    Ok(())
}

/// Insert secondary (polling) outbox rows.
pub(crate) async fn insert_aux_rows<C: GenericClient>(
    client: &C,
    consumer_name: &str,
    messages: &[Message],
) -> OutboxResult<()> {
    let (ids, types, payloads) = columns(messages);
    client
        .execute(
            r#"INSERT INTO hermes.outbox_aux ("consumerName", "messageId", "messageType", "data")
               SELECT $4, m.id, m.kind, m.payload
               FROM unnest($1::text[], $2::text[], $3::jsonb[])
                    WITH ORDINALITY AS m(id, kind, payload, ord)
               ORDER BY m.ord"#,
            &[&ids, &types, &payloads, &consumer_name],
        )
        .await?;
    Ok(())
}

/// One consumer-state row, keyed by (consumer name, partition key).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConsumerState {
    pub last_acked: Lsn,
    pub redelivery_count: u32,
}

/// Load the state row, creating it on first start.
pub(crate) async fn load_or_create_state(
    client: &Client,
    consumer_name: &str,
    partition_key: &str,
) -> OutboxResult<ConsumerState> {
    client
        .execute(
            r#"INSERT INTO hermes.consumer_state ("consumerName", "partitionKey")
               VALUES ($1, $2)
               ON CONFLICT ("consumerName", "partitionKey") DO NOTHING"#,
            &[&consumer_name, &partition_key],
        )
        .await?;

    let row = client
        .query_one(
            r#"SELECT "lastAckedPosition", "redeliveryCount"
               FROM hermes.consumer_state
               WHERE "consumerName" = $1 AND "partitionKey" = $2"#,
            &[&consumer_name, &partition_key],
        )
        .await?;

    let token: String = row.get(0);
    let redelivery_count: i32 = row.get(1);
    Ok(ConsumerState {
        last_acked: token.parse()?,
        redelivery_count: redelivery_count.max(0) as u32,
    })
}

/// Advance the acknowledged position and reset the redelivery counter.
pub(crate) async fn advance_state(
    client: &Client,
    consumer_name: &str,
    partition_key: &str,
    acked: Lsn,
) -> OutboxResult<()> {
    client
        .execute(
            r#"UPDATE hermes.consumer_state
               SET "lastAckedPosition" = $3, "redeliveryCount" = 0, "updatedAt" = now()
               WHERE "consumerName" = $1 AND "partitionKey" = $2"#,
            &[&consumer_name, &partition_key, &acked.to_string()],
        )
        .await?;
    Ok(())
}

/// Persist the redelivery counter of the oldest un-acknowledged transaction.
pub(crate) async fn record_redelivery(
    client: &Client,
    consumer_name: &str,
    partition_key: &str,
    attempts: u32,
) -> OutboxResult<()> {
    client
        .execute(
            r#"UPDATE hermes.consumer_state
               SET "redeliveryCount" = $3, "updatedAt" = now()
               WHERE "consumerName" = $1 AND "partitionKey" = $2"#,
            &[&consumer_name, &partition_key, &(attempts as i32)],
        )
        .await?;
    Ok(())
}

/// Stamp the delivery timestamp on acknowledged primary rows.
pub(crate) async fn stamp_sent_at(
    client: &Client,
    positions: &[i64],
    sent_at: DateTime<Utc>,
) -> OutboxResult<()> {
    if positions.is_empty() {
        return Ok(());
    }
    client
        .execute(
            r#"UPDATE hermes.outbox SET "sentAt" = $2 WHERE "position" = ANY($1)"#,
            &[&positions, &sent_at],
        )
        .await?;
    Ok(())
}

/// Terminate any lingering server session still holding the slot.
///
/// Best effort; used by `stop` so a restart can reacquire the slot promptly.
pub(crate) async fn terminate_slot_sessions(client: &Client, slot: &str) -> OutboxResult<u64> {
    let rows = client
        .query(
            r#"SELECT pg_terminate_backend(active_pid)
               FROM pg_replication_slots
               WHERE slot_name = $1
                 AND active_pid IS NOT NULL
                 AND active_pid <> pg_backend_pid()"#,
            &[&slot],
        )
        .await?;
    Ok(rows.len() as u64)
}

/// Auxiliary-outbox storage over the query connection.
pub(crate) struct PgAuxiliaryStore {
    pub client: Arc<Client>,
    pub consumer_name: String,
}

#[async_trait]
impl AuxiliaryStore for PgAuxiliaryStore {
    async fn fetch_undelivered(&self, limit: i64) -> OutboxResult<Vec<AuxiliaryRow>> {
        let rows = self
            .client
            .query(
                r#"SELECT "position", "messageId", "messageType", "data", "failsCount", "addedAt"
                   FROM hermes.outbox_aux
                   WHERE "consumerName" = $1 AND "delivered" = FALSE
                   ORDER BY "addedAt" ASC
                   LIMIT $2"#,
                &[&self.consumer_name, &limit],
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let fails_count: i32 = row.get(4);
                Ok(AuxiliaryRow {
                    position: row.get(0),
                    message_id: row.get(1),
                    message_type: row.get(2),
                    data: row.get(3),
                    fails_count: fails_count.max(0) as u32,
                    added_at: row.get(5),
                })
            })
            .collect()
    }

    async fn mark_delivered(&self, position: i64, sent_at: DateTime<Utc>) -> OutboxResult<()> {
        let updated = self
            .client
            .execute(
                r#"UPDATE hermes.outbox_aux
                   SET "delivered" = TRUE, "sentAt" = $2
                   WHERE "position" = $1"#,
                &[&position, &sent_at],
            )
            .await?;
        if updated == 0 {
            return Err(OutboxError::storage(format!(
                "auxiliary row {position} vanished before delivery flag"
            )));
        }
        Ok(())
    }

    async fn mark_failed(&self, position: i64) -> OutboxResult<()> {
        self.client
            .execute(
                r#"UPDATE hermes.outbox_aux
                   SET "failsCount" = "failsCount" + 1
                   WHERE "position" = $1"#,
                &[&position],
            )
            .await?;
        Ok(())
    }
}
