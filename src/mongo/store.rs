//! Document access for the change-feed backend
//!
//! All reads and writes against the outbox database live here: position
//! allocation, outbox inserts, the consumer-state document with its lease,
//! and the auxiliary polling queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, DateTime as BsonDateTime, Document, doc};
use mongodb::options::ReturnDocument;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    AUX_COLLECTION, COUNTERS_COLLECTION, OUTBOX_COLLECTION, STATE_COLLECTION, aux_counter_scope,
    outbox_counter_scope,
};
use crate::auxiliary::{AuxiliaryRow, AuxiliaryStore};
use crate::errors::{OutboxError, OutboxResult};
use crate::message::Message;

/// Primary outbox document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OutboxDocument {
    pub position: i64,
    pub message_id: String,
    pub message_type: String,
    pub partition_key: String,
    pub data: Bson,
}

/// Secondary (polling) outbox document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuxDocument {
    pub position: i64,
    pub consumer_name: String,
    pub message_id: String,
    pub message_type: String,
    pub data: Bson,
    pub delivered: bool,
    pub fails_count: i32,
    pub added_at: BsonDateTime,
    pub sent_at: Option<BsonDateTime>,
}

/// Consumer-state document, one per (consumer name, partition key)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConsumerStateDocument {
    pub consumer_name: String,
    pub partition_key: String,
    /// Resume token of the last acknowledged change, serialized as JSON
    pub last_acked_position: Option<String>,
    pub redelivery_count: i32,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
    pub lease: Option<Lease>,
}

/// Liveness lease enforcing one consumer per partition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Lease {
    pub owner: String,
    pub expires_at: BsonDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterDocument {
    #[serde(rename = "_id")]
    scope: String,
    seq: i64,
}

pub(crate) fn to_bson_payload(value: &serde_json::Value) -> OutboxResult<Bson> {
    mongodb::bson::to_bson(value)
        .map_err(|e| OutboxError::storage_with("payload is not BSON-representable", e))
}

pub(crate) fn from_bson_payload(bson: Bson) -> serde_json::Value {
    bson.into_relaxed_extjson()
}

fn bson_datetime(at: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(at.timestamp_millis())
}

fn chrono_datetime(at: BsonDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Storage facade over one outbox database.
#[derive(Clone)]
pub(crate) struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn outbox(&self) -> Collection<OutboxDocument> {
        self.db.collection(OUTBOX_COLLECTION)
    }

    fn aux(&self) -> Collection<AuxDocument> {
        self.db.collection(AUX_COLLECTION)
    }

    fn state(&self) -> Collection<ConsumerStateDocument> {
        self.db.collection(STATE_COLLECTION)
    }

    fn counters(&self) -> Collection<CounterDocument> {
        self.db.collection(COUNTERS_COLLECTION)
    }

    /// Reserve `count` consecutive positions in a scope; returns the first.
    async fn allocate_positions(
        &self,
        scope: &str,
        count: i64,
        session: Option<&mut ClientSession>,
    ) -> OutboxResult<i64> {
        let counters = self.counters();
        let action = counters
            .find_one_and_update(
                doc! { "_id": scope },
                doc! { "$inc": { "seq": count } },
            )
            .upsert(true)
            .return_document(ReturnDocument::After);
        let counter = match session {
            Some(session) => action.session(session).await?,
            None => action.await?,
        }
        .ok_or_else(|| OutboxError::storage("position counter upsert returned nothing"))?;
        Ok(counter.seq - count + 1)
    }

    /// Insert primary outbox rows, in order, with freshly allocated positions.
    pub async fn insert_outbox(
        &self,
        partition_key: &str,
        messages: &[Message],
        mut session: Option<&mut ClientSession>,
    ) -> OutboxResult<()> {
        let first = self
            .allocate_positions(
                &outbox_counter_scope(partition_key),
                messages.len() as i64,
                session.as_deref_mut(),
            )
            .await?;

        let documents = messages
            .iter()
            .enumerate()
            .map(|(i, message)| {
                Ok(OutboxDocument {
                    position: first + i as i64,
                    message_id: message.message_id.clone(),
                    message_type: message.message_type.clone(),
                    partition_key: partition_key.to_string(),
                    data: to_bson_payload(&message.data)?,
                })
            })
            .collect::<OutboxResult<Vec<_>>>()?;

        let outbox = self.outbox();
        let action = outbox.insert_many(documents);
        match session {
            Some(session) => {
                action.session(session).await?;
            }
            None => {
                action.await?;
            }
        }
        debug!(count = messages.len(), partition_key, "outbox documents inserted");
        Ok(())
    }

    /// Insert secondary outbox rows for the polling loop.
    pub async fn insert_aux(
        &self,
        consumer_name: &str,
        messages: &[Message],
        now: DateTime<Utc>,
        mut session: Option<&mut ClientSession>,
    ) -> OutboxResult<()> {
        let first = self
            .allocate_positions(
                &aux_counter_scope(consumer_name),
                messages.len() as i64,
                session.as_deref_mut(),
            )
            .await?;

        let documents = messages
            .iter()
            .enumerate()
            .map(|(i, message)| {
                Ok(AuxDocument {
                    position: first + i as i64,
                    consumer_name: consumer_name.to_string(),
                    message_id: message.message_id.clone(),
                    message_type: message.message_type.clone(),
                    data: to_bson_payload(&message.data)?,
                    delivered: false,
                    fails_count: 0,
                    added_at: bson_datetime(now),
                    sent_at: None,
                })
            })
            .collect::<OutboxResult<Vec<_>>>()?;

        let aux = self.aux();
        let action = aux.insert_many(documents);
        match session {
            Some(session) => {
                action.session(session).await?;
            }
            None => {
                action.await?;
            }
        }
        Ok(())
    }

    /// Load the consumer-state document, creating it on first start.
    pub async fn load_or_create_state(
        &self,
        consumer_name: &str,
        partition_key: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<ConsumerStateDocument> {
        let key = doc! { "consumerName": consumer_name, "partitionKey": partition_key };
        if let Some(state) = self.state().find_one(key.clone()).await? {
            return Ok(state);
        }

        let fresh = ConsumerStateDocument {
            consumer_name: consumer_name.to_string(),
            partition_key: partition_key.to_string(),
            last_acked_position: None,
            redelivery_count: 0,
            created_at: bson_datetime(now),
            updated_at: bson_datetime(now),
            lease: None,
        };
        match self.state().insert_one(&fresh).await {
            Ok(_) => Ok(fresh),
            // Lost the creation race; the other process's document wins
            Err(err) if is_duplicate_key(&err) => self
                .state()
                .find_one(key)
                .await?
                .ok_or_else(|| OutboxError::storage("consumer state vanished after race")),
            Err(err) => Err(err.into()),
        }
    }

    /// Take the partition lease, or fail with `ConsumerAlreadyTaken`.
    pub async fn acquire_lease(
        &self,
        consumer_name: &str,
        partition_key: &str,
        owner: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> OutboxResult<()> {
        let taken = self
            .state()
            .find_one_and_update(
                doc! {
                    "consumerName": consumer_name,
                    "partitionKey": partition_key,
                    "$or": [
                        { "lease": Bson::Null },
                        { "lease.expiresAt": { "$lt": bson_datetime(now) } },
                        { "lease.owner": owner },
                    ],
                },
                doc! { "$set": { "lease": {
                    "owner": owner,
                    "expiresAt": bson_datetime(now + ttl),
                } } },
            )
            .await?;

        match taken {
            Some(_) => Ok(()),
            None => Err(OutboxError::ConsumerAlreadyTaken {
                consumer_name: consumer_name.to_string(),
                partition_key: partition_key.to_string(),
            }),
        }
    }

    /// Extend our lease; a lost lease surfaces as `ConsumerAlreadyTaken`.
    pub async fn renew_lease(
        &self,
        consumer_name: &str,
        partition_key: &str,
        owner: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> OutboxResult<()> {
        let renewed = self
            .state()
            .find_one_and_update(
                doc! {
                    "consumerName": consumer_name,
                    "partitionKey": partition_key,
                    "lease.owner": owner,
                },
                doc! { "$set": { "lease.expiresAt": bson_datetime(now + ttl) } },
            )
            .await?;
        match renewed {
            Some(_) => Ok(()),
            None => Err(OutboxError::ConsumerAlreadyTaken {
                consumer_name: consumer_name.to_string(),
                partition_key: partition_key.to_string(),
            }),
        }
    }

    /// Drop the lease if we still hold it.
    pub async fn release_lease(
        &self,
        consumer_name: &str,
        partition_key: &str,
        owner: &str,
    ) -> OutboxResult<()> {
        self.state()
            .update_one(
                doc! {
                    "consumerName": consumer_name,
                    "partitionKey": partition_key,
                    "lease.owner": owner,
                },
                doc! { "$set": { "lease": Bson::Null } },
            )
            .await?;
        Ok(())
    }

    /// Advance the acknowledged token and reset the redelivery counter.
    pub async fn advance_state(
        &self,
        consumer_name: &str,
        partition_key: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<()> {
        self.state()
            .update_one(
                doc! { "consumerName": consumer_name, "partitionKey": partition_key },
                doc! { "$set": {
                    "lastAckedPosition": token,
                    "redeliveryCount": 0,
                    "updatedAt": bson_datetime(now),
                } },
            )
            .await?;
        Ok(())
    }

    /// Persist the redelivery counter of the oldest un-acknowledged batch.
    pub async fn record_redelivery(
        &self,
        consumer_name: &str,
        partition_key: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> OutboxResult<()> {
        self.state()
            .update_one(
                doc! { "consumerName": consumer_name, "partitionKey": partition_key },
                doc! { "$set": {
                    "redeliveryCount": attempts as i32,
                    "updatedAt": bson_datetime(now),
                } },
            )
            .await?;
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref write))
            if write.code == 11000
    )
}

/// Auxiliary-outbox storage for the polling loop.
pub(crate) struct MongoAuxiliaryStore {
    pub store: MongoStore,
    pub consumer_name: String,
}

#[async_trait]
impl AuxiliaryStore for MongoAuxiliaryStore {
    async fn fetch_undelivered(&self, limit: i64) -> OutboxResult<Vec<AuxiliaryRow>> {
        use futures::TryStreamExt;

        let cursor = self
            .store
            .aux()
            .find(doc! { "consumerName": &self.consumer_name, "delivered": false })
            .sort(doc! { "addedAt": 1 })
            .limit(limit)
            .await?;
        let documents: Vec<AuxDocument> = cursor.try_collect().await?;

        Ok(documents
            .into_iter()
            .map(|document| AuxiliaryRow {
                position: document.position,
                message_id: document.message_id,
                message_type: document.message_type,
                data: from_bson_payload(document.data),
                fails_count: document.fails_count.max(0) as u32,
                added_at: chrono_datetime(document.added_at),
            })
            .collect())
    }

    async fn mark_delivered(&self, position: i64, sent_at: DateTime<Utc>) -> OutboxResult<()> {
        let updated = self
            .store
            .aux()
            .update_one(
                doc! { "consumerName": &self.consumer_name, "position": position },
                doc! { "$set": {
                    "delivered": true,
                    "sentAt": bson_datetime(sent_at),
                } },
            )
            .await?;
        if updated.matched_count == 0 {
            return Err(OutboxError::storage(format!(
                "auxiliary document {position} vanished before delivery flag"
            )));
        }
        Ok(())
    }

    async fn mark_failed(&self, position: i64) -> OutboxResult<()> {
        self.store
            .aux()
            .update_one(
                doc! { "consumerName": &self.consumer_name, "position": position },
                doc! { "$inc": { "failsCount": 1 } },
            )
            .await?;
        Ok(())
    }
}

/// Filter document for the partition-scoped insert stream.
pub(crate) fn change_stream_filter(partition_key: &str) -> Document {
    doc! {
        "$match": {
            "operationType": "insert",
            "fullDocument.partitionKey": partition_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_round_trips_through_bson() {
        let value = json!({ "total": 12, "items": ["a", "b"], "nested": { "ok": true } });
        let bson = to_bson_payload(&value).unwrap();
        assert_eq!(from_bson_payload(bson), value);
    }

    #[test]
    fn outbox_document_uses_the_contract_field_names() {
        let document = OutboxDocument {
            position: 1,
            message_id: "m1".into(),
            message_type: "X".into(),
            partition_key: "default".into(),
            data: Bson::Null,
        };
        let bson = mongodb::bson::to_document(&document).unwrap();
        for key in ["position", "messageId", "messageType", "partitionKey", "data"] {
            assert!(bson.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn stream_filter_scopes_to_partition_inserts() {
        let filter = change_stream_filter("eu");
        let matcher = filter.get_document("$match").unwrap();
        assert_eq!(matcher.get_str("operationType").unwrap(), "insert");
        assert_eq!(matcher.get_str("fullDocument.partitionKey").unwrap(), "eu");
    }
}
