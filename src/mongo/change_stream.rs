//! Change-feed ingestor
//!
//! One [`FeedSession`] wraps one live change stream cursor. Every insert into
//! the watched partition becomes a single-envelope transaction batch; the
//! event's resume token is the batch's source token. Recoverable cursor
//! errors are handled by the consumer reopening a session from the last
//! acknowledged token; a token that fell off the oplog is `PositionLost`.

use futures::StreamExt;
use mongodb::change_stream::ChangeStream;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::FullDocumentType;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::store::{MongoStore, OutboxDocument, change_stream_filter, from_bson_payload};
use crate::errors::{OutboxError, OutboxResult};
use crate::message::{Envelope, TransactionBatch};

// Server error codes meaning the resume token is beyond recovery
const CHANGE_STREAM_FATAL: i32 = 280;
const CHANGE_STREAM_HISTORY_LOST: i32 = 286;

/// Whether a stream error means the stored token can never resume again.
pub(crate) fn is_position_lost(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        mongodb::error::ErrorKind::Command(ref command)
            if command.code == CHANGE_STREAM_HISTORY_LOST || command.code == CHANGE_STREAM_FATAL
    )
}

/// Serialize a resume token for the consumer-state document.
pub(crate) fn token_to_string(token: &ResumeToken) -> OutboxResult<String> {
    serde_json::to_string(token)
        .map_err(|e| OutboxError::storage_with("resume token not serializable", e))
}

pub(crate) fn token_from_string(raw: &str) -> OutboxResult<ResumeToken> {
    serde_json::from_str(raw).map_err(|_| OutboxError::PositionLost {
        token: raw.to_string(),
    })
}

/// Open a partition-scoped insert stream, resuming after `token` if present.
pub(crate) async fn open_stream(
    store: &MongoStore,
    partition_key: &str,
    token: Option<ResumeToken>,
) -> OutboxResult<ChangeStream<ChangeStreamEvent<OutboxDocument>>> {
    let outbox = store.outbox();
    let mut watch = outbox
        .watch()
        .pipeline([change_stream_filter(partition_key)])
        .full_document(FullDocumentType::UpdateLookup);
    if let Some(token) = token {
        watch = watch.start_after(token);
    }

    match watch.await {
        Ok(stream) => {
            info!(partition_key, "change stream open");
            Ok(stream)
        }
        Err(err) if is_position_lost(&err) => Err(OutboxError::PositionLost {
            token: "<resume token beyond oplog retention>".to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

/// One live change stream session.
pub(crate) struct FeedSession {
    pub stream: ChangeStream<ChangeStreamEvent<OutboxDocument>>,
    pub shutdown: watch::Receiver<bool>,
    pub batches: mpsc::Sender<TransactionBatch>,
}

impl FeedSession {
    /// Drive the cursor until shutdown (Ok) or a cursor failure (Err).
    pub async fn run(self) -> OutboxResult<()> {
        let Self {
            mut stream,
            mut shutdown,
            batches,
        } = self;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("change stream closed for shutdown");
                    return Ok(());
                }
                event = stream.next() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(err)) => {
                            if is_position_lost(&err) {
                                return Err(OutboxError::PositionLost {
                                    token: "<resume token beyond oplog retention>".to_string(),
                                });
                            }
                            return Err(err.into());
                        }
                        None => return Err(OutboxError::storage("change stream ended")),
                    };

                    let Some(batch) = batch_from_event(event)? else {
                        continue;
                    };
                    // A full channel suspends us here; the cursor stops being
                    // polled, which is the backpressure signal upstream.
                    if batches.send(batch).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Map one insert event to a single-envelope batch.
///
/// Document-backend transactions are not reassembled beyond their natural
/// per-insert granularity; the allocated position orders batches within the
/// partition.
fn batch_from_event(
    event: ChangeStreamEvent<OutboxDocument>,
) -> OutboxResult<Option<TransactionBatch>> {
    if event.operation_type != OperationType::Insert {
        debug!(operation = ?event.operation_type, "ignoring non-insert change event");
        return Ok(None);
    }
    let document = event.full_document.ok_or_else(|| {
        OutboxError::storage("insert event without a full document")
    })?;
    let token = token_to_string(&event.id)?;

    let committed_at = event
        .cluster_time
        .and_then(|ts| chrono::DateTime::from_timestamp(ts.time as i64, 0));

    let envelope = Envelope {
        position: document.position,
        message_id: document.message_id,
        message_type: document.message_type,
        partition_key: document.partition_key,
        redelivery_count: 0,
        source_position: Some(token.clone()),
        data: from_bson_payload(document.data),
    };

    Ok(Some(TransactionBatch {
        transaction_id: None,
        commit_position: envelope.position.max(0) as u64,
        source_token: token,
        committed_at,
        messages: vec![envelope],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_tokens_round_trip_through_json() {
        let token: ResumeToken =
            serde_json::from_value(serde_json::json!({ "_data": "8263B1F8" })).unwrap();
        let serialized = token_to_string(&token).unwrap();
        let restored = token_from_string(&serialized).unwrap();
        assert_eq!(token_to_string(&restored).unwrap(), serialized);
    }

    #[test]
    fn garbage_stored_token_is_position_lost() {
        assert!(matches!(
            token_from_string("not json"),
            Err(OutboxError::PositionLost { .. })
        ));
    }
}
