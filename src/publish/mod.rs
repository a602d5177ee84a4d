//! Publishing queue
//!
//! Stages delivered transaction batches, invokes the user publish callback
//! and advances acknowledgement strictly in commit order. Two interchangeable
//! variants exist: [`serialized::SerializedQueue`] keeps at most one publish
//! call in flight; [`pipelined::PipelinedQueue`] overlaps a bounded number of
//! calls and reorders acknowledgements back into commit order.

pub mod pipelined;
pub mod serialized;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::config::ErrorCallback;
use crate::errors::{OutboxError, OutboxResult};
use crate::message::{Envelope, TransactionBatch};

/// User-supplied publish callback.
///
/// Invoked once per transaction batch with the batch's full, ordered envelope
/// sequence. Returning `Ok` marks the batch delivered; returning `Err` causes
/// a retry after the configured delay. Delivery is at-least-once, so the
/// callback must tolerate duplicates of the same `message_id`.
///
/// Any `Fn(Vec<Envelope>) -> impl Future<Output = anyhow::Result<()>>`
/// closure implements this trait.
#[async_trait]
pub trait PublishHandler: Send + Sync {
    async fn publish(&self, messages: Vec<Envelope>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> PublishHandler for F
where
    F: Fn(Vec<Envelope>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn publish(&self, messages: Vec<Envelope>) -> anyhow::Result<()> {
        (self)(messages).await
    }
}

/// The queue is shutting down; the batch was not (or will not be) acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// Where acknowledgements land.
///
/// Implementations persist the consumer-state row. Both methods are expected
/// to retry transient storage failures themselves (reporting through the
/// consumer's `on_db_error` sink) and return `Err(QueueClosed)` only when the
/// consumer is stopping.
#[async_trait]
pub trait AckSink: Send + Sync {
    /// Called exactly once per batch, strictly in commit order.
    async fn ack(&self, batch: &TransactionBatch) -> Result<(), QueueClosed>;

    /// Persist the redelivery counter before the next publish attempt.
    async fn record_redelivery(
        &self,
        batch: &TransactionBatch,
        attempts: u32,
    ) -> Result<(), QueueClosed>;
}

/// Everything a queue variant needs to run batches.
pub struct QueueContext {
    pub handler: Arc<dyn PublishHandler>,
    pub ack: Arc<dyn AckSink>,
    pub on_failed_publish: ErrorCallback,
    pub retry_delay: Duration,
    pub shutdown: watch::Receiver<bool>,
    /// Redelivery counter persisted before the crash, applied to the first
    /// batch submitted after a restart
    pub initial_attempts: AtomicU32,
}

impl QueueContext {
    pub fn new(
        handler: Arc<dyn PublishHandler>,
        ack: Arc<dyn AckSink>,
        on_failed_publish: ErrorCallback,
        retry_delay: Duration,
        shutdown: watch::Receiver<bool>,
        initial_attempts: u32,
    ) -> Self {
        Self {
            handler,
            ack,
            on_failed_publish,
            retry_delay,
            shutdown,
            initial_attempts: AtomicU32::new(initial_attempts),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn take_initial_attempts(&self) -> u32 {
        self.initial_attempts.swap(0, Ordering::SeqCst)
    }
}

/// Outcome reported through a [`Delivery`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Published and acknowledged
    Acknowledged,
    /// Dropped because the queue shut down first
    Cancelled,
}

/// Completion handle for one submitted batch.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl Delivery {
    pub(crate) fn pair() -> (oneshot::Sender<DeliveryOutcome>, Delivery) {
        let (tx, rx) = oneshot::channel();
        (tx, Delivery { rx })
    }

    pub(crate) fn cancelled() -> Delivery {
        let (tx, delivery) = Self::pair();
        let _ = tx.send(DeliveryOutcome::Cancelled);
        delivery
    }

    /// Block until the batch has been published and acknowledged, or dropped
    /// by shutdown.
    pub async fn wait(self) -> DeliveryOutcome {
        self.rx.await.unwrap_or(DeliveryOutcome::Cancelled)
    }
}

/// Common contract of the two queue variants.
#[async_trait]
pub trait PublishQueue: Send + Sync {
    /// Stage a batch. Completes once the batch is accepted (which may wait
    /// for capacity); the returned handle resolves when the batch has been
    /// acknowledged.
    async fn submit(&self, batch: TransactionBatch) -> Delivery;

    /// Stop accepting batches, cancel retry waits, and wait for in-flight
    /// work to settle. In-flight publish callbacks are not interrupted, but
    /// their results are ignored.
    async fn close(&self);
}

/// Publish one batch, retrying until it succeeds or shutdown intervenes.
///
/// Empty batches are ack-only markers for commits with no rows in this
/// partition; the callback never sees them. The redelivery counter is
/// persisted before every retry so a crash mid-retry resumes the count.
pub(crate) async fn publish_with_retry(
    ctx: &QueueContext,
    batch: &mut TransactionBatch,
) -> Result<(), QueueClosed> {
    if batch.messages.is_empty() {
        return Ok(());
    }

    let mut attempts = ctx.take_initial_attempts();
    let mut shutdown = ctx.shutdown.clone();

    loop {
        if ctx.is_shutting_down() {
            return Err(QueueClosed);
        }

        batch.set_redelivery_count(attempts);
        match ctx.handler.publish(batch.messages.clone()).await {
            Ok(()) => {
                // A stop that raced the callback wins; the result is ignored
                // and the batch will be redelivered on restart.
                if ctx.is_shutting_down() {
                    return Err(QueueClosed);
                }
                debug!(
                    commit_position = batch.commit_position,
                    messages = batch.messages.len(),
                    attempts,
                    "batch published"
                );
                return Ok(());
            }
            Err(err) => {
                attempts += 1;
                warn!(
                    commit_position = batch.commit_position,
                    attempts, "publish callback failed: {err:#}"
                );
                let publish_err = OutboxError::Publish(err);
                (ctx.on_failed_publish)(&publish_err);
                ctx.ack.record_redelivery(batch, attempts).await?;

                tokio::select! {
                    _ = tokio::time::sleep(ctx.retry_delay) => {}
                    _ = shutdown.changed() => return Err(QueueClosed),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;
    use serde_json::json;

    /// Opt-in log output for debugging test runs (RUST_LOG=debug).
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// Records acknowledgements and redelivery persists for assertions.
    #[derive(Default)]
    pub struct RecordingAckSink {
        pub acked: Mutex<Vec<u64>>,
        pub redeliveries: Mutex<Vec<(u64, u32)>>,
    }

    #[async_trait]
    impl AckSink for RecordingAckSink {
        async fn ack(&self, batch: &TransactionBatch) -> Result<(), QueueClosed> {
            self.acked.lock().unwrap().push(batch.commit_position);
            Ok(())
        }

        async fn record_redelivery(
            &self,
            batch: &TransactionBatch,
            attempts: u32,
        ) -> Result<(), QueueClosed> {
            self.redeliveries
                .lock()
                .unwrap()
                .push((batch.commit_position, attempts));
            Ok(())
        }
    }

    pub fn batch(commit_position: u64, message_ids: &[&str]) -> TransactionBatch {
        TransactionBatch {
            transaction_id: Some(commit_position.to_string()),
            commit_position,
            source_token: format!("0/{commit_position:X}"),
            committed_at: None,
            messages: message_ids
                .iter()
                .enumerate()
                .map(|(i, id)| Envelope {
                    position: commit_position as i64 * 100 + i as i64,
                    message_id: (*id).to_string(),
                    message_type: "Test".into(),
                    partition_key: "default".into(),
                    redelivery_count: 0,
                    source_position: Some(format!("0/{commit_position:X}")),
                    data: json!({ "id": id }),
                })
                .collect(),
        }
    }

    pub fn context(
        handler: Arc<dyn PublishHandler>,
        ack: Arc<dyn AckSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<QueueContext> {
        Arc::new(QueueContext::new(
            handler,
            ack,
            Arc::new(|_| {}),
            Duration::from_millis(5),
            shutdown,
            0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn retries_until_success_and_counts_redeliveries() {
        init_tracing();
        let calls: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let calls_in_handler = calls.clone();
        let handler = move |messages: Vec<Envelope>| {
            let calls = calls_in_handler.clone();
            async move {
                let attempt = messages[0].redelivery_count;
                calls.lock().unwrap().push(attempt);
                if attempt < 2 {
                    anyhow::bail!("broker unavailable");
                }
                Ok(())
            }
        };

        let ack = Arc::new(RecordingAckSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = context(Arc::new(handler), ack.clone(), shutdown_rx);

        let mut b = batch(1, &["m1"]);
        publish_with_retry(&ctx, &mut b).await.unwrap();

        // three invocations: redelivery counts 0, 1, 2
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
        // counter persisted before each retry
        assert_eq!(*ack.redeliveries.lock().unwrap(), vec![(1, 1), (1, 2)]);
        assert_eq!(b.messages[0].redelivery_count, 2);
    }

    #[tokio::test]
    async fn initial_attempts_seed_the_first_batch_only() {
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let handler = move |messages: Vec<Envelope>| {
            let seen = seen_in_handler.clone();
            async move {
                seen.lock().unwrap().push(messages[0].redelivery_count);
                Ok(())
            }
        };

        let ack = Arc::new(RecordingAckSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(QueueContext::new(
            Arc::new(handler),
            ack,
            Arc::new(|_| {}),
            Duration::from_millis(5),
            shutdown_rx,
            3,
        ));

        publish_with_retry(&ctx, &mut batch(1, &["m1"])).await.unwrap();
        publish_with_retry(&ctx, &mut batch(2, &["m2"])).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![3, 0]);
    }

    #[tokio::test]
    async fn empty_batches_skip_the_callback() {
        let handler = |_: Vec<Envelope>| async { panic!("callback must not run") };
        let ack = Arc::new(RecordingAckSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = context(Arc::new(handler), ack, shutdown_rx);

        publish_with_retry(&ctx, &mut batch(7, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_the_retry_wait() {
        let handler = |_: Vec<Envelope>| async { anyhow::bail!("always failing") };
        let ack = Arc::new(RecordingAckSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(QueueContext::new(
            Arc::new(handler),
            ack,
            Arc::new(|_| {}),
            Duration::from_secs(3600),
            shutdown_rx,
            0,
        ));

        let worker = tokio::spawn(async move {
            let mut b = batch(1, &["m1"]);
            publish_with_retry(&ctx, &mut b).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("retry wait must be cancelled promptly")
            .unwrap();
        assert_eq!(result, Err(QueueClosed));
    }
}
