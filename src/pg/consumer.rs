//! Per-partition outbox consumer for the log-streaming backend
//!
//! Binds everything together: runs migrations, loads the consumer-state row,
//! acquires the replication slot, and wires ingestor → publishing queue →
//! state store. `enqueue` and `send` are the host-facing write APIs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use super::connection::{FrameReader, FrameWriter, ReplicationClient};
use super::replication::{AckTracker, StreamSession, TransactionDecoder};
use super::{migrations, publication_name, slot_name, store};
use crate::config::{Clock, ConnectionSource, ErrorCallback, PgConsumerOptions};
use crate::errors::{OutboxError, OutboxResult};
use crate::lsn::Lsn;
use crate::message::{Message, TransactionBatch};
use crate::protocol::columns::TableSpec;
use crate::publish::pipelined::PipelinedQueue;
use crate::publish::serialized::SerializedQueue;
use crate::publish::{AckSink, PublishQueue, QueueClosed, QueueContext};
use crate::signal::spawn_signal_listener;

/// Capacity of the ingestor → publisher staging channel
const BATCH_CHANNEL_CAPACITY: usize = 64;

/// Cooperative close window for the replication socket
const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CEIL: Duration = Duration::from_secs(30);

/// Per-call options for `enqueue`.
#[derive(Default)]
pub struct EnqueueOptions<'a> {
    /// Host-managed transaction making the enqueue atomic with business writes
    pub tx: Option<&'a tokio_postgres::Transaction<'a>>,
    /// Override of the consumer's default partition for this call
    pub partition_key: Option<String>,
}

/// Per-call options for `send`.
#[derive(Default)]
pub struct SendOptions<'a> {
    pub tx: Option<&'a tokio_postgres::Transaction<'a>>,
}

enum State {
    Unstarted,
    Starting,
    Running(Box<RunningState>),
    Stopping,
    Stopped,
}

struct RunningState {
    client: Arc<Client>,
    connection_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    queue: Arc<dyn PublishQueue>,
    ingest_task: JoinHandle<()>,
    publish_task: JoinHandle<()>,
    auxiliary_task: Option<JoinHandle<()>>,
    signal_task: Option<JoinHandle<()>>,
}

/// Transactional-outbox consumer over PostgreSQL logical replication.
///
/// One instance owns one (consumer name, partition key) pair. `start`
/// acquires the partition's replication slot; a second live consumer for the
/// same pair fails with `ConsumerAlreadyTaken`. Restart after `stop` is
/// supported and reacquires the slot.
pub struct PgOutboxConsumer {
    options: PgConsumerOptions,
    slot: String,
    publication: String,
    table_spec: TableSpec,
    state: Arc<Mutex<State>>,
}

/// Idempotent handle returned by `start`; stops the consumer it came from.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<Mutex<State>>,
    slot: String,
}

impl StopHandle {
    pub async fn stop(&self) -> OutboxResult<()> {
        stop_consumer(&self.state, &self.slot).await
    }
}

impl PgOutboxConsumer {
    pub fn new(options: PgConsumerOptions) -> OutboxResult<Self> {
        options.validate()?;
        let slot = slot_name(&options.consumer_name, &options.partition_key);
        let publication = publication_name(&options.consumer_name);
        Ok(Self {
            options,
            slot,
            publication,
            table_spec: TableSpec::outbox(),
            state: Arc::new(Mutex::new(State::Unstarted)),
        })
    }

    pub fn consumer_name(&self) -> &str {
        &self.options.consumer_name
    }

    pub fn partition_key(&self) -> &str {
        &self.options.partition_key
    }

    /// Start the consumer: migrations, state row, slot acquisition, tasks.
    pub async fn start(&self) -> OutboxResult<StopHandle> {
        let mut state = self.state.lock().await;
        match *state {
            State::Unstarted | State::Stopped => {}
            _ => return Err(OutboxError::config("consumer is already started")),
        }
        *state = State::Starting;

        match self.start_inner().await {
            Ok(running) => {
                *state = State::Running(Box::new(running));
                info!(
                    consumer_name = %self.options.consumer_name,
                    partition_key = %self.options.partition_key,
                    "consumer running"
                );
                Ok(StopHandle {
                    state: self.state.clone(),
                    slot: self.slot.clone(),
                })
            }
            Err(err) => {
                *state = State::Stopped;
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> OutboxResult<RunningState> {
        let options = &self.options;
        let connection_options = (options.get_connection_options)();

        // Query connection, driven by its own task for the consumer lifetime
        let (client, connection) = connection_options
            .to_pg_config()
            .connect(NoTls)
            .await?;
        let client = Arc::new(client);
        let on_db_error = options.on_db_error.clone();
        let connection_task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("query connection terminated: {err}");
                (on_db_error)(&err.into());
            }
        });

        let result = async {
            migrations::run(
                &client,
                &self.publication,
                &self.slot,
                options.auxiliary.is_some(),
            )
            .await?;

            let consumer_state = store::load_or_create_state(
                &client,
                &options.consumer_name,
                &options.partition_key,
            )
            .await?;
            info!(
                last_acked = %consumer_state.last_acked,
                redelivery_count = consumer_state.redelivery_count,
                "consumer state loaded"
            );

            // Acquire the slot before spawning anything so a held slot
            // surfaces synchronously from start.
            let io = open_stream(
                &connection_options,
                &self.slot,
                &self.publication,
                consumer_state.last_acked,
                &options.consumer_name,
                &options.partition_key,
            )
            .await?;

            Ok::<_, OutboxError>((consumer_state, io))
        }
        .await;

        let (consumer_state, first_io) = match result {
            Ok(parts) => parts,
            Err(err) => {
                connection_task.abort();
                return Err(err);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = AckTracker::new(consumer_state.last_acked);

        let ack_sink = Arc::new(PgAckSink {
            client: client.clone(),
            consumer_name: options.consumer_name.clone(),
            partition_key: options.partition_key.clone(),
            tracker: tracker.clone(),
            save_timestamps: options.save_timestamps,
            on_db_error: options.on_db_error.clone(),
            now: options.now.clone(),
            shutdown: shutdown_rx.clone(),
        });

        let ctx = Arc::new(QueueContext::new(
            options.publish.clone(),
            ack_sink,
            options.on_failed_publish.clone(),
            options.wait_after_failed_publish,
            shutdown_rx.clone(),
            consumer_state.redelivery_count,
        ));
        let queue: Arc<dyn PublishQueue> = if options.serialization {
            Arc::new(SerializedQueue::new(ctx, BATCH_CHANNEL_CAPACITY))
        } else {
            Arc::new(PipelinedQueue::new(ctx, options.max_in_flight))
        };

        let (batch_tx, batch_rx) = mpsc::channel::<TransactionBatch>(BATCH_CHANNEL_CAPACITY);

        let ingest_task = tokio::spawn(run_ingest_loop(IngestLoop {
            connection_options: options.get_connection_options.clone(),
            slot: self.slot.clone(),
            publication: self.publication.clone(),
            consumer_name: options.consumer_name.clone(),
            partition_key: options.partition_key.clone(),
            table_spec: self.table_spec.clone(),
            tracker: tracker.clone(),
            status_interval: options.status_interval,
            clock: options.now.clone(),
            on_db_error: options.on_db_error.clone(),
            shutdown: shutdown_rx.clone(),
            batches: batch_tx,
            first_io: Some(first_io),
        }));

        let publish_task = tokio::spawn(run_publish_loop(
            batch_rx,
            queue.clone(),
            shutdown_rx.clone(),
        ));

        let auxiliary_task = options.auxiliary.clone().map(|aux_options| {
            crate::auxiliary::AuxiliaryWorker {
                store: Arc::new(store::PgAuxiliaryStore {
                    client: client.clone(),
                    consumer_name: options.consumer_name.clone(),
                }),
                handler: options.publish.clone(),
                options: aux_options,
                partition_key: options.partition_key.clone(),
                on_failed_publish: options.on_failed_publish.clone(),
                on_db_error: options.on_db_error.clone(),
                now: options.now.clone(),
                shutdown: shutdown_rx.clone(),
            }
            .spawn()
        });

        let signal_task = options.dispose_on_signal.then(|| {
            let handle = StopHandle {
                state: self.state.clone(),
                slot: self.slot.clone(),
            };
            // Stop runs on its own task; the teardown aborts this listener,
            // which must never take the in-flight stop down with it.
            spawn_signal_listener(
                move || async move {
                    let _ = tokio::spawn(async move {
                        if let Err(err) = handle.stop().await {
                            error!("signal-driven stop failed: {err}");
                        }
                    })
                    .await;
                },
                shutdown_rx,
            )
        });

        Ok(RunningState {
            client,
            connection_task,
            shutdown: shutdown_tx,
            queue,
            ingest_task,
            publish_task,
            auxiliary_task,
            signal_task,
        })
    }

    /// Stop the consumer. Idempotent and safe to call concurrently.
    pub async fn stop(&self) -> OutboxResult<()> {
        stop_consumer(&self.state, &self.slot).await
    }

    /// Enqueue messages into the primary outbox under the default partition.
    pub async fn enqueue(&self, messages: Vec<Message>) -> OutboxResult<()> {
        self.enqueue_with(messages, EnqueueOptions::default()).await
    }

    /// Convenience wrapper for a single message.
    pub async fn enqueue_one(&self, message: Message) -> OutboxResult<()> {
        self.enqueue(vec![message]).await
    }

    /// Enqueue with a host transaction and/or a partition override.
    ///
    /// Insertion order within the call is preserved in row position order.
    pub async fn enqueue_with(
        &self,
        messages: Vec<Message>,
        options: EnqueueOptions<'_>,
    ) -> OutboxResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let client = self.running_client().await?;
        let partition_key = options
            .partition_key
            .as_deref()
            .unwrap_or(&self.options.partition_key);

        match options.tx {
            Some(tx) => store::insert_outbox_rows(tx, partition_key, &messages).await,
            None => store::insert_outbox_rows(client.as_ref(), partition_key, &messages).await,
        }
    }

    /// Enqueue messages into the secondary (polling) outbox.
    pub async fn send(&self, messages: Vec<Message>) -> OutboxResult<()> {
        self.send_with(messages, SendOptions::default()).await
    }

    /// Convenience wrapper for a single message.
    pub async fn send_one(&self, message: Message) -> OutboxResult<()> {
        self.send(vec![message]).await
    }

    pub async fn send_with(
        &self,
        messages: Vec<Message>,
        options: SendOptions<'_>,
    ) -> OutboxResult<()> {
        if self.options.auxiliary.is_none() {
            return Err(OutboxError::AuxiliaryNotConfigured);
        }
        if messages.is_empty() {
            return Ok(());
        }
        let client = self.running_client().await?;

        match options.tx {
            Some(tx) => {
                store::insert_aux_rows(tx, &self.options.consumer_name, &messages).await
            }
            None => {
                store::insert_aux_rows(client.as_ref(), &self.options.consumer_name, &messages)
                    .await
            }
        }
    }

    async fn running_client(&self) -> OutboxResult<Arc<Client>> {
        match &*self.state.lock().await {
            State::Running(running) => Ok(running.client.clone()),
            _ => Err(OutboxError::NotStarted),
        }
    }
}

async fn stop_consumer(state: &Arc<Mutex<State>>, slot: &str) -> OutboxResult<()> {
    let mut state = state.lock().await;
    let running = match std::mem::replace(&mut *state, State::Stopping) {
        State::Running(running) => running,
        // Nothing to tear down; keep whatever terminal state was there
        previous => {
            *state = match previous {
                State::Stopping | State::Stopped => State::Stopped,
                other => other,
            };
            return Ok(());
        }
    };

    info!(%slot, "stopping consumer");
    let _ = running.shutdown.send(true);

    // The session sends a final status update and says goodbye; give it a
    // moment before closing the socket the hard way.
    let mut ingest_task = running.ingest_task;
    if tokio::time::timeout(SOCKET_CLOSE_TIMEOUT, &mut ingest_task)
        .await
        .is_err()
    {
        warn!("replication session did not close in time, dropping the socket");
        ingest_task.abort();
    }

    // Any server session still holding the slot is in the way of a restart
    match store::terminate_slot_sessions(&running.client, slot).await {
        Ok(0) => {}
        Ok(count) => info!(count, "terminated lingering slot sessions"),
        Err(err) => debug!("slot takeover skipped: {err}"),
    }

    running.queue.close().await;
    let _ = running.publish_task.await;
    if let Some(task) = running.auxiliary_task {
        let _ = task.await;
    }
    if let Some(task) = running.signal_task {
        task.abort();
    }
    running.connection_task.abort();

    *state = State::Stopped;
    info!(%slot, "consumer stopped");
    Ok(())
}

/// Open one replication session: connect, identify, start streaming.
async fn open_stream(
    connection_options: &crate::config::ConnectionOptions,
    slot: &str,
    publication: &str,
    start: Lsn,
    consumer_name: &str,
    partition_key: &str,
) -> OutboxResult<(FrameReader, FrameWriter)> {
    let mut client = ReplicationClient::connect(connection_options).await?;
    client.identify_system().await?;
    client
        .start_replication(slot, publication, start, consumer_name, partition_key)
        .await
}

struct IngestLoop {
    connection_options: ConnectionSource,
    slot: String,
    publication: String,
    consumer_name: String,
    partition_key: String,
    table_spec: TableSpec,
    tracker: Arc<AckTracker>,
    status_interval: Duration,
    clock: Clock,
    on_db_error: ErrorCallback,
    shutdown: watch::Receiver<bool>,
    batches: mpsc::Sender<TransactionBatch>,
    first_io: Option<(FrameReader, FrameWriter)>,
}

/// Reader task: run stream sessions, reconnecting from the last acked token
/// with exponential backoff after failures.
async fn run_ingest_loop(mut loop_state: IngestLoop) {
    let mut backoff = RECONNECT_BACKOFF_FLOOR;
    let mut shutdown = loop_state.shutdown.clone();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let io = match loop_state.first_io.take() {
            Some(io) => io,
            None => {
                let connection_options = (loop_state.connection_options)();
                match open_stream(
                    &connection_options,
                    &loop_state.slot,
                    &loop_state.publication,
                    loop_state.tracker.acked(),
                    &loop_state.consumer_name,
                    &loop_state.partition_key,
                )
                .await
                {
                    Ok(io) => io,
                    Err(err @ OutboxError::ConsumerAlreadyTaken { .. }) => {
                        // Another live consumer holds the slot; retrying
                        // would fail identically forever
                        error!("replication slot held elsewhere, giving up: {err}");
                        (loop_state.on_db_error)(&err);
                        break;
                    }
                    Err(err) if !err.is_recoverable() => {
                        error!("replication reconnect failed fatally: {err}");
                        (loop_state.on_db_error)(&err);
                        break;
                    }
                    Err(err) => {
                        warn!("replication reconnect failed: {err}");
                        (loop_state.on_db_error)(&err);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => break,
                        }
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEIL);
                        continue;
                    }
                }
            }
        };
        backoff = RECONNECT_BACKOFF_FLOOR;

        let session = StreamSession {
            reader: io.0,
            writer: io.1,
            decoder: TransactionDecoder::new(
                loop_state.table_spec.clone(),
                loop_state.partition_key.clone(),
            ),
            tracker: loop_state.tracker.clone(),
            status_interval: loop_state.status_interval,
            clock: loop_state.clock.clone(),
            shutdown: shutdown.clone(),
            batches: loop_state.batches.clone(),
        };

        match session.run().await {
            Ok(()) => break,
            Err(err) if !err.is_recoverable() => {
                error!("replication session failed fatally: {err}");
                (loop_state.on_db_error)(&err);
                break;
            }
            Err(err) => {
                // Fatal to the session only; the next one resumes from the
                // last acknowledged position, duplicates are tolerated.
                warn!("replication session failed: {err}");
                (loop_state.on_db_error)(&err);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEIL);
            }
        }
    }
}

/// Publisher task: feed staged batches into the publishing queue.
async fn run_publish_loop(
    mut batches: mpsc::Receiver<TransactionBatch>,
    queue: Arc<dyn PublishQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            batch = batches.recv() => match batch {
                Some(batch) => {
                    let _ = queue.submit(batch).await;
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Acknowledgement sink persisting the consumer-state row.
struct PgAckSink {
    client: Arc<Client>,
    consumer_name: String,
    partition_key: String,
    tracker: Arc<AckTracker>,
    save_timestamps: bool,
    on_db_error: ErrorCallback,
    now: Clock,
    shutdown: watch::Receiver<bool>,
}

impl PgAckSink {
    /// Retry a storage write with backoff until it lands or shutdown wins.
    async fn with_storage_retry<F, Fut>(&self, mut op: F) -> Result<(), QueueClosed>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = OutboxResult<()>>,
    {
        let mut shutdown = self.shutdown.clone();
        let mut backoff = Duration::from_millis(500);
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("consumer-state write failed: {err}");
                    (self.on_db_error)(&err);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return Err(QueueClosed),
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        }
    }
}

#[async_trait]
impl AckSink for PgAckSink {
    async fn ack(&self, batch: &TransactionBatch) -> Result<(), QueueClosed> {
        let acked = Lsn(batch.commit_position);
        self.with_storage_retry(|| {
            store::advance_state(&self.client, &self.consumer_name, &self.partition_key, acked)
        })
        .await?;

        if self.save_timestamps && !batch.messages.is_empty() {
            let positions: Vec<i64> = batch.messages.iter().map(|m| m.position).collect();
            let sent_at = (self.now)();
            if let Err(err) = store::stamp_sent_at(&self.client, &positions, sent_at).await {
                // Cosmetic metadata; never holds up acknowledgement
                warn!("failed to stamp delivery timestamps: {err}");
                (self.on_db_error)(&err);
            }
        }

        self.tracker.advance(acked);
        self.tracker.batch_settled();
        debug!(%acked, "position acknowledged");
        Ok(())
    }

    async fn record_redelivery(
        &self,
        _batch: &TransactionBatch,
        attempts: u32,
    ) -> Result<(), QueueClosed> {
        self.with_storage_retry(|| {
            store::record_redelivery(
                &self.client,
                &self.consumer_name,
                &self.partition_key,
                attempts,
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use crate::message::Envelope;
    use serde_json::json;

    fn consumer(auxiliary: bool) -> PgOutboxConsumer {
        let connection = ConnectionOptions {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: None,
            dbname: "app".into(),
        };
        let mut options = PgConsumerOptions::new("orders", connection, |_: Vec<Envelope>| async {
            anyhow::Ok(())
        });
        if auxiliary {
            options.auxiliary = Some(Default::default());
        }
        PgOutboxConsumer::new(options).unwrap()
    }

    #[tokio::test]
    async fn enqueue_before_start_fails_with_not_started() {
        let consumer = consumer(false);
        let result = consumer
            .enqueue_one(Message::new("m1", "X", json!({"v": 1})))
            .await;
        assert!(matches!(result, Err(OutboxError::NotStarted)));
    }

    #[tokio::test]
    async fn send_without_auxiliary_is_rejected() {
        let consumer = consumer(false);
        let result = consumer
            .send_one(Message::new("c1", "Compensate", json!({"x": 1})))
            .await;
        assert!(matches!(result, Err(OutboxError::AuxiliaryNotConfigured)));
    }

    #[tokio::test]
    async fn send_with_auxiliary_still_requires_start() {
        let consumer = consumer(true);
        let result = consumer
            .send_one(Message::new("c1", "Compensate", json!({"x": 1})))
            .await;
        assert!(matches!(result, Err(OutboxError::NotStarted)));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_quiet_no_op() {
        let consumer = consumer(false);
        consumer.stop().await.unwrap();
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn slot_and_publication_derive_from_identity() {
        let consumer = consumer(false);
        assert_eq!(consumer.slot, "hermes_orders_default");
        assert_eq!(consumer.publication, "hermes_orders");
    }
}
