//! Log-backend ingestor
//!
//! Turns the replication frame stream into committed transaction batches and
//! keeps the server informed of the acknowledged position. One
//! [`StreamSession`] covers one live replication connection; the consumer
//! reopens a fresh session from the last acknowledged token after transport
//! errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::connection::{FrameReader, FrameWriter};
use super::store::OUTBOX_TABLE;
use crate::config::Clock;
use crate::errors::{OutboxError, OutboxResult};
use crate::lsn::Lsn;
use crate::message::{Envelope, TransactionBatch};
use crate::protocol::columns::{OutboxRow, TableSpec};
use crate::protocol::messages::{
    LogicalMessage, PrimaryKeepalive, RelationInfo, ReplicationFrame, StandbyStatusUpdate, XLogData,
};
use crate::protocol::parser::MessageParser;
use crate::protocol::{Oid, datetime_to_pg_timestamp};

/// Shared acknowledgement bookkeeping between the session and the ack task.
pub(crate) struct AckTracker {
    /// Last position reported (and safe to report) to the server
    acked: AtomicU64,
    /// Batches handed downstream but not yet acknowledged
    in_flight: AtomicI64,
}

impl AckTracker {
    pub fn new(start: Lsn) -> Arc<Self> {
        Arc::new(Self {
            acked: AtomicU64::new(start.0),
            in_flight: AtomicI64::new(0),
        })
    }

    pub fn acked(&self) -> Lsn {
        Lsn(self.acked.load(Ordering::SeqCst))
    }

    pub fn advance(&self, to: Lsn) {
        self.acked.fetch_max(to.0, Ordering::SeqCst);
    }

    pub fn batch_submitted(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn batch_settled(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }
}

/// Assembles logical messages into per-transaction batches for one partition.
pub(crate) struct TransactionDecoder {
    table_spec: TableSpec,
    partition_key: String,
    relations: HashMap<Oid, RelationInfo>,
    current: Option<PendingTransaction>,
}

struct PendingTransaction {
    xid: u32,
    messages: Vec<Envelope>,
}

impl TransactionDecoder {
    pub fn new(table_spec: TableSpec, partition_key: impl Into<String>) -> Self {
        Self {
            table_spec,
            partition_key: partition_key.into(),
            relations: HashMap::new(),
            current: None,
        }
    }

    /// Feed one `XLogData` frame; yields a batch when a transaction commits.
    ///
    /// Commits with no rows for this partition still yield a batch so the
    /// acknowledged position can advance past them in order.
    pub fn handle(&mut self, frame: XLogData) -> OutboxResult<Option<TransactionBatch>> {
        match MessageParser::parse(&frame.data)? {
            LogicalMessage::Begin { xid, .. } => {
                if self.current.is_some() {
                    warn!(xid, "begin while a transaction is open, dropping the old one");
                }
                self.current = Some(PendingTransaction {
                    xid,
                    messages: Vec::new(),
                });
                Ok(None)
            }
            LogicalMessage::Relation(relation) => {
                self.relations.insert(relation.oid, relation);
                Ok(None)
            }
            LogicalMessage::Insert { relation_id, tuple } => {
                let relation = self.relations.get(&relation_id).ok_or_else(|| {
                    OutboxError::protocol(format!("insert for unknown relation {relation_id}"))
                })?;
                if relation.name != OUTBOX_TABLE {
                    return Ok(None);
                }
                let row =
                    OutboxRow::from_values(self.table_spec.decode(relation, &tuple)?)?;
                let current = self.current.as_mut().ok_or_else(|| {
                    OutboxError::protocol("insert outside of a transaction")
                })?;
                if row.partition_key == self.partition_key {
                    current.messages.push(envelope_from_row(row, frame.wal_start));
                }
                Ok(None)
            }
            LogicalMessage::Commit {
                end_lsn, timestamp, ..
            } => {
                let current = self
                    .current
                    .take()
                    .ok_or_else(|| OutboxError::protocol("commit without begin"))?;
                Ok(Some(TransactionBatch {
                    transaction_id: Some(current.xid.to_string()),
                    commit_position: end_lsn.0,
                    source_token: end_lsn.to_string(),
                    committed_at: crate::protocol::pg_timestamp_to_datetime(timestamp),
                    messages: current.messages,
                }))
            }
            LogicalMessage::Skipped { tag } => {
                debug!(?tag, "skipped logical message");
                Ok(None)
            }
        }
    }
}

fn envelope_from_row(row: OutboxRow, location: Lsn) -> Envelope {
    Envelope {
        position: row.position,
        message_id: row.message_id,
        message_type: row.message_type,
        partition_key: row.partition_key,
        redelivery_count: 0,
        source_position: Some(location.to_string()),
        data: row.data,
    }
}

/// One live replication stream session.
pub(crate) struct StreamSession {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    pub decoder: TransactionDecoder,
    pub tracker: Arc<AckTracker>,
    pub status_interval: Duration,
    pub clock: Clock,
    pub shutdown: watch::Receiver<bool>,
    pub batches: mpsc::Sender<TransactionBatch>,
}

impl StreamSession {
    /// Drive the session until shutdown (Ok) or a stream failure (Err).
    ///
    /// Status updates go out on the fixed cadence, whenever the server asks,
    /// and one final time during shutdown so the slot position is fresh.
    pub async fn run(self) -> OutboxResult<()> {
        let Self {
            mut reader,
            mut writer,
            mut decoder,
            tracker,
            status_interval,
            clock,
            mut shutdown,
            batches,
        } = self;

        let mut ticker = tokio::time::interval(status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let update = status_update(&tracker, &clock);
                    if let Err(err) = writer.send_status_update(update).await {
                        warn!("final status update failed: {err}");
                    }
                    writer.send_shutdown().await;
                    info!("replication session closed for shutdown");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    writer.send_status_update(status_update(&tracker, &clock)).await?;
                }
                frame = reader.next_frame() => {
                    match frame? {
                        None => {
                            return Err(OutboxError::protocol("server ended the copy stream"));
                        }
                        Some(ReplicationFrame::Keepalive(keepalive)) => {
                            handle_keepalive(&keepalive, &tracker);
                            if keepalive.reply_requested {
                                writer
                                    .send_status_update(status_update(&tracker, &clock))
                                    .await?;
                            }
                        }
                        Some(ReplicationFrame::XLogData(xlog)) => {
                            if let Some(batch) = decoder.handle(xlog)? {
                                tracker.batch_submitted();
                                // A full channel suspends us here, which stalls
                                // acknowledgement upstream: that is the
                                // backpressure signal to the source.
                                if batches.send(batch).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn handle_keepalive(keepalive: &PrimaryKeepalive, tracker: &AckTracker) {
    // With nothing in flight the server's write position is fully processed;
    // reporting it keeps slot retention moving during quiet periods. The
    // persisted row is untouched, restarting from the older token is safe.
    if tracker.is_idle() && keepalive.wal_end > tracker.acked() {
        tracker.advance(keepalive.wal_end);
    }
}

fn status_update(tracker: &AckTracker, clock: &Clock) -> StandbyStatusUpdate {
    StandbyStatusUpdate::at(tracker.acked(), datetime_to_pg_timestamp(clock()))
}
