//! Per-partition outbox consumer for the change-feed backend
//!
//! Same lifecycle and guarantees as the log-streaming consumer, built on a
//! resumable change stream. Partition exclusivity is a lease on the
//! consumer-state document instead of a replication slot.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use mongodb::{Client, ClientSession};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::change_stream::{FeedSession, open_stream, token_from_string};
use super::migrations;
use super::store::{MongoAuxiliaryStore, MongoStore};
use crate::config::{Clock, ErrorCallback, MongoConsumerOptions};
use crate::errors::{OutboxError, OutboxResult};
use crate::message::{Message, TransactionBatch};
use crate::publish::pipelined::PipelinedQueue;
use crate::publish::serialized::SerializedQueue;
use crate::publish::{AckSink, PublishQueue, QueueClosed, QueueContext};
use crate::signal::spawn_signal_listener;

const BATCH_CHANNEL_CAPACITY: usize = 64;
const CURSOR_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const LEASE_TTL_SECS: i64 = 30;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CEIL: Duration = Duration::from_secs(30);

/// Per-call options for `enqueue`.
#[derive(Default)]
pub struct MongoEnqueueOptions<'a> {
    /// Host-managed session (with an open transaction) making the enqueue
    /// atomic with the business write
    pub session: Option<&'a mut ClientSession>,
    /// Override of the consumer's default partition for this call
    pub partition_key: Option<String>,
}

/// Per-call options for `send`.
#[derive(Default)]
pub struct MongoSendOptions<'a> {
    pub session: Option<&'a mut ClientSession>,
}

/// Latest acknowledged resume token, shared with the reconnect loop.
#[derive(Default)]
struct TokenTracker(StdMutex<Option<String>>);

impl TokenTracker {
    fn advance(&self, token: String) {
        *self.0.lock().unwrap() = Some(token);
    }

    fn current(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

enum State {
    Unstarted,
    Starting,
    Running(Box<RunningState>),
    Stopping,
    Stopped,
}

struct RunningState {
    client: Client,
    store: MongoStore,
    owner: String,
    shutdown: Arc<watch::Sender<bool>>,
    queue: Arc<dyn PublishQueue>,
    feed_task: JoinHandle<()>,
    publish_task: JoinHandle<()>,
    lease_task: JoinHandle<()>,
    auxiliary_task: Option<JoinHandle<()>>,
    signal_task: Option<JoinHandle<()>>,
}

/// Transactional-outbox consumer over MongoDB change streams.
pub struct MongoOutboxConsumer {
    options: MongoConsumerOptions,
    state: Arc<Mutex<State>>,
}

/// Idempotent handle returned by `start`.
#[derive(Clone)]
pub struct MongoStopHandle {
    state: Arc<Mutex<State>>,
    consumer_name: String,
    partition_key: String,
}

impl MongoStopHandle {
    pub async fn stop(&self) -> OutboxResult<()> {
        stop_consumer(&self.state, &self.consumer_name, &self.partition_key).await
    }
}

impl MongoOutboxConsumer {
    pub fn new(options: MongoConsumerOptions) -> OutboxResult<Self> {
        options.validate()?;
        Ok(Self {
            options,
            state: Arc::new(Mutex::new(State::Unstarted)),
        })
    }

    pub fn consumer_name(&self) -> &str {
        &self.options.consumer_name
    }

    pub fn partition_key(&self) -> &str {
        &self.options.partition_key
    }

    fn scope(&self) -> String {
        format!(
            "{}/{}",
            self.options.consumer_name, self.options.partition_key
        )
    }

    fn stop_handle(&self) -> MongoStopHandle {
        MongoStopHandle {
            state: self.state.clone(),
            consumer_name: self.options.consumer_name.clone(),
            partition_key: self.options.partition_key.clone(),
        }
    }

    /// Start the consumer: version gate, migrations, lease, change stream.
    pub async fn start(&self) -> OutboxResult<MongoStopHandle> {
        let mut state = self.state.lock().await;
        match *state {
            State::Unstarted | State::Stopped => {}
            _ => return Err(OutboxError::config("consumer is already started")),
        }
        *state = State::Starting;

        match self.start_inner().await {
            Ok(running) => {
                *state = State::Running(Box::new(running));
                info!(scope = %self.scope(), "consumer running");
                Ok(self.stop_handle())
            }
            Err(err) => {
                *state = State::Stopped;
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> OutboxResult<RunningState> {
        let options = &self.options;
        let connection = (options.get_connection_options)();

        let client = Client::with_uri_str(&connection.uri).await?;
        let store = MongoStore::new(client.database(&connection.database));

        let owner = Uuid::new_v4().to_string();
        let result = async {
            migrations::run(store.database(), options.auxiliary.is_some()).await?;

            let consumer_state = store
                .load_or_create_state(
                    &options.consumer_name,
                    &options.partition_key,
                    (options.now)(),
                )
                .await?;

            store
                .acquire_lease(
                    &options.consumer_name,
                    &options.partition_key,
                    &owner,
                    (options.now)(),
                    chrono::Duration::seconds(LEASE_TTL_SECS),
                )
                .await?;
            info!(
                scope = %self.scope(),
                redelivery_count = consumer_state.redelivery_count,
                resuming = consumer_state.last_acked_position.is_some(),
                "lease acquired"
            );

            // Open the stream before spawning anything so an unrecoverable
            // token or an unsupported server surfaces synchronously from
            // start.
            let resume_token = consumer_state
                .last_acked_position
                .as_deref()
                .map(token_from_string)
                .transpose()?;
            let first_stream = open_stream(&store, &options.partition_key, resume_token).await?;
            Ok::<_, OutboxError>((consumer_state, first_stream))
        }
        .await;

        let (consumer_state, first_stream) = match result {
            Ok(parts) => parts,
            Err(err) => {
                client.shutdown().await;
                return Err(err);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let tracker = Arc::new(TokenTracker::default());
        if let Some(token) = consumer_state.last_acked_position.clone() {
            tracker.advance(token);
        }

        let ack_sink = Arc::new(MongoAckSink {
            store: store.clone(),
            consumer_name: options.consumer_name.clone(),
            partition_key: options.partition_key.clone(),
            tracker: tracker.clone(),
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
            consumer_state.redelivery_count.max(0) as u32,
        ));
        let queue: Arc<dyn PublishQueue> = if options.serialization {
            Arc::new(SerializedQueue::new(ctx, BATCH_CHANNEL_CAPACITY))
        } else {
            Arc::new(PipelinedQueue::new(ctx, options.max_in_flight))
        };

        let (batch_tx, batch_rx) = mpsc::channel::<TransactionBatch>(BATCH_CHANNEL_CAPACITY);

        let feed_task = tokio::spawn(run_feed_loop(FeedLoop {
            store: store.clone(),
            partition_key: options.partition_key.clone(),
            tracker: tracker.clone(),
            on_db_error: options.on_db_error.clone(),
            shutdown: shutdown_rx.clone(),
            batches: batch_tx,
            first_stream: Some(first_stream),
        }));

        let publish_task = tokio::spawn(run_publish_loop(
            batch_rx,
            queue.clone(),
            shutdown_rx.clone(),
        ));

        let lease_task = tokio::spawn(run_lease_heartbeat(
            store.clone(),
            options.consumer_name.clone(),
            options.partition_key.clone(),
            owner.clone(),
            options.now.clone(),
            options.on_db_error.clone(),
            shutdown_tx.clone(),
            shutdown_rx.clone(),
        ));

        let auxiliary_task = options.auxiliary.clone().map(|aux_options| {
            crate::auxiliary::AuxiliaryWorker {
                store: Arc::new(MongoAuxiliaryStore {
                    store: store.clone(),
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
            let handle = self.stop_handle();
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
            store,
            owner,
            shutdown: shutdown_tx,
            queue,
            feed_task,
            publish_task,
            lease_task,
            auxiliary_task,
            signal_task,
        })
    }

    /// Stop the consumer. Idempotent and safe to call concurrently.
    pub async fn stop(&self) -> OutboxResult<()> {
        stop_consumer(
            &self.state,
            &self.options.consumer_name,
            &self.options.partition_key,
        )
        .await
    }

    /// Enqueue messages into the primary outbox under the default partition.
    pub async fn enqueue(&self, messages: Vec<Message>) -> OutboxResult<()> {
        self.enqueue_with(messages, MongoEnqueueOptions::default())
            .await
    }

    pub async fn enqueue_one(&self, message: Message) -> OutboxResult<()> {
        self.enqueue(vec![message]).await
    }

    /// Enqueue with a host session and/or a partition override.
    pub async fn enqueue_with(
        &self,
        messages: Vec<Message>,
        options: MongoEnqueueOptions<'_>,
    ) -> OutboxResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let store = self.running_store().await?;
        let partition_key = options
            .partition_key
            .as_deref()
            .unwrap_or(&self.options.partition_key);
        store
            .insert_outbox(partition_key, &messages, options.session)
            .await
    }

    /// Enqueue messages into the secondary (polling) outbox.
    pub async fn send(&self, messages: Vec<Message>) -> OutboxResult<()> {
        self.send_with(messages, MongoSendOptions::default()).await
    }

    pub async fn send_one(&self, message: Message) -> OutboxResult<()> {
        self.send(vec![message]).await
    }

    pub async fn send_with(
        &self,
        messages: Vec<Message>,
        options: MongoSendOptions<'_>,
    ) -> OutboxResult<()> {
        if self.options.auxiliary.is_none() {
            return Err(OutboxError::AuxiliaryNotConfigured);
        }
        if messages.is_empty() {
            return Ok(());
        }
        let store = self.running_store().await?;
        store
            .insert_aux(
                &self.options.consumer_name,
                &messages,
                (self.options.now)(),
                options.session,
            )
            .await
    }

    async fn running_store(&self) -> OutboxResult<MongoStore> {
        match &*self.state.lock().await {
            State::Running(running) => Ok(running.store.clone()),
            _ => Err(OutboxError::NotStarted),
        }
    }
}

async fn stop_consumer(
    state: &Arc<Mutex<State>>,
    consumer_name: &str,
    partition_key: &str,
) -> OutboxResult<()> {
    let mut state = state.lock().await;
    let running = match std::mem::replace(&mut *state, State::Stopping) {
        State::Running(running) => running,
        previous => {
            *state = match previous {
                State::Stopping | State::Stopped => State::Stopped,
                other => other,
            };
            return Ok(());
        }
    };

    info!(consumer_name, partition_key, "stopping consumer");
    let _ = running.shutdown.send(true);

    let mut feed_task = running.feed_task;
    if tokio::time::timeout(CURSOR_CLOSE_TIMEOUT, &mut feed_task)
        .await
        .is_err()
    {
        warn!("change stream did not close in time, dropping the cursor");
        feed_task.abort();
    }

    running.queue.close().await;
    let _ = running.publish_task.await;
    let _ = running.lease_task.await;
    if let Some(task) = running.auxiliary_task {
        let _ = task.await;
    }
    if let Some(task) = running.signal_task {
        task.abort();
    }

    // Free the partition for the next starter, then drop the client
    if let Err(err) = running
        .store
        .release_lease(consumer_name, partition_key, &running.owner)
        .await
    {
        debug!("lease release skipped: {err}");
    }
    running.client.shutdown().await;

    *state = State::Stopped;
    info!(consumer_name, partition_key, "consumer stopped");
    Ok(())
}

struct FeedLoop {
    store: MongoStore,
    partition_key: String,
    tracker: Arc<TokenTracker>,
    on_db_error: ErrorCallback,
    shutdown: watch::Receiver<bool>,
    batches: mpsc::Sender<TransactionBatch>,
    first_stream: Option<
        mongodb::change_stream::ChangeStream<
            mongodb::change_stream::event::ChangeStreamEvent<super::store::OutboxDocument>,
        >,
    >,
}

/// Reader task: run feed sessions, reopening the cursor from the last acked
/// token after recoverable errors. `PositionLost` ends the loop for good.
async fn run_feed_loop(mut loop_state: FeedLoop) {
    let mut backoff = RECONNECT_BACKOFF_FLOOR;
    let mut shutdown = loop_state.shutdown.clone();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let stream = match loop_state.first_stream.take() {
            Some(stream) => stream,
            None => {
                let token = match loop_state
                    .tracker
                    .current()
                    .as_deref()
                    .map(token_from_string)
                    .transpose()
                {
                    Ok(token) => token,
                    Err(err) => {
                        error!("stored resume token unusable: {err}");
                        (loop_state.on_db_error)(&err);
                        break;
                    }
                };
                match open_stream(&loop_state.store, &loop_state.partition_key, token).await {
                    Ok(stream) => stream,
                    Err(err @ OutboxError::PositionLost { .. }) => {
                        error!("resume position lost, operator action required: {err}");
                        (loop_state.on_db_error)(&err);
                        break;
                    }
                    Err(err) if !err.is_recoverable() => {
                        error!("change stream reconnect failed fatally: {err}");
                        (loop_state.on_db_error)(&err);
                        break;
                    }
                    Err(err) => {
                        warn!("change stream reconnect failed: {err}");
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

        let session = FeedSession {
            stream,
            shutdown: shutdown.clone(),
            batches: loop_state.batches.clone(),
        };
        match session.run().await {
            Ok(()) => break,
            Err(err @ OutboxError::PositionLost { .. }) => {
                error!("resume position lost, operator action required: {err}");
                (loop_state.on_db_error)(&err);
                break;
            }
            Err(err) if !err.is_recoverable() => {
                error!("change stream session failed fatally: {err}");
                (loop_state.on_db_error)(&err);
                break;
            }
            Err(err) => {
                warn!("change stream session failed: {err}");
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

/// Heartbeat task: keep the lease alive; fence ourselves if it is lost.
#[allow(clippy::too_many_arguments)]
async fn run_lease_heartbeat(
    store: MongoStore,
    consumer_name: String,
    partition_key: String,
    owner: String,
    clock: Clock,
    on_db_error: ErrorCallback,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(LEASE_RENEW_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match store
                    .renew_lease(
                        &consumer_name,
                        &partition_key,
                        &owner,
                        clock(),
                        chrono::Duration::seconds(LEASE_TTL_SECS),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(err @ OutboxError::ConsumerAlreadyTaken { .. }) => {
                        // Someone else took the partition; stop delivering
                        error!("partition lease lost, fencing this consumer: {err}");
                        (on_db_error)(&err);
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    Err(err) => {
                        warn!("lease renewal failed: {err}");
                        (on_db_error)(&err);
                    }
                }
            }
        }
    }
}

/// Acknowledgement sink persisting the consumer-state document.
struct MongoAckSink {
    store: MongoStore,
    consumer_name: String,
    partition_key: String,
    tracker: Arc<TokenTracker>,
    on_db_error: ErrorCallback,
    now: Clock,
    shutdown: watch::Receiver<bool>,
}

impl MongoAckSink {
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
impl AckSink for MongoAckSink {
    async fn ack(&self, batch: &TransactionBatch) -> Result<(), QueueClosed> {
        self.with_storage_retry(|| {
            self.store.advance_state(
                &self.consumer_name,
                &self.partition_key,
                &batch.source_token,
                (self.now)(),
            )
        })
        .await?;
        self.tracker.advance(batch.source_token.clone());
        debug!(position = batch.commit_position, "position acknowledged");
        Ok(())
    }

    async fn record_redelivery(
        &self,
        _batch: &TransactionBatch,
        attempts: u32,
    ) -> Result<(), QueueClosed> {
        self.with_storage_retry(|| {
            self.store.record_redelivery(
                &self.consumer_name,
                &self.partition_key,
                attempts,
                (self.now)(),
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MongoConnectionOptions;
    use crate::message::Envelope;
    use serde_json::json;

    fn consumer(auxiliary: bool) -> MongoOutboxConsumer {
        let connection = MongoConnectionOptions {
            uri: "mongodb://localhost:27017".into(),
            database: "app".into(),
        };
        let mut options =
            MongoConsumerOptions::new("orders", connection, |_: Vec<Envelope>| async {
                anyhow::Ok(())
            });
        if auxiliary {
            options.auxiliary = Some(Default::default());
        }
        MongoOutboxConsumer::new(options).unwrap()
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
    async fn stop_before_start_is_a_quiet_no_op() {
        let consumer = consumer(true);
        consumer.stop().await.unwrap();
        consumer.stop().await.unwrap();
    }

    #[test]
    fn token_tracker_keeps_the_latest_token() {
        let tracker = TokenTracker::default();
        assert!(tracker.current().is_none());
        tracker.advance("t1".into());
        tracker.advance("t2".into());
        assert_eq!(tracker.current().as_deref(), Some("t2"));
    }
}
