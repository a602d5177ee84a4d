//! Strictly serialized publishing queue
//!
//! At most one publish call in flight; each batch is published, acknowledged
//! and only then is the next batch taken. Simplest correctness, used when the
//! consumer is configured with `serialization = true`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Delivery, DeliveryOutcome, PublishQueue, QueueContext, publish_with_retry};
use crate::message::TransactionBatch;

struct Job {
    batch: TransactionBatch,
    done: tokio::sync::oneshot::Sender<DeliveryOutcome>,
}

/// Publishing queue with a single worker draining batches one at a time.
pub struct SerializedQueue {
    tx: mpsc::Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerializedQueue {
    pub fn new(ctx: Arc<QueueContext>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(ctx, rx));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }
}

async fn run_worker(ctx: Arc<QueueContext>, mut rx: mpsc::Receiver<Job>) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let mut batch = job.batch;
        let outcome = match publish_with_retry(&ctx, &mut batch).await {
            Ok(()) => match ctx.ack.ack(&batch).await {
                Ok(()) => DeliveryOutcome::Acknowledged,
                Err(_) => DeliveryOutcome::Cancelled,
            },
            Err(_) => DeliveryOutcome::Cancelled,
        };

        debug!(
            commit_position = batch.commit_position,
            ?outcome,
            "serialized batch settled"
        );
        let _ = job.done.send(outcome);

        if outcome == DeliveryOutcome::Cancelled {
            break;
        }
    }

    // Anything still queued is dropped; restart redelivers it.
    rx.close();
    while let Some(job) = rx.recv().await {
        let _ = job.done.send(DeliveryOutcome::Cancelled);
    }
    info!("serialized publishing queue drained");
}

#[async_trait]
impl PublishQueue for SerializedQueue {
    async fn submit(&self, batch: TransactionBatch) -> Delivery {
        let (done, delivery) = Delivery::pair();
        if self.tx.send(Job { batch, done }).await.is_err() {
            return Delivery::cancelled();
        }
        delivery
    }

    async fn close(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::sync::watch;

    use super::super::test_support::*;
    use super::*;
    use crate::message::Envelope;
    use crate::publish::PublishHandler;

    #[tokio::test]
    async fn publishes_and_acks_in_submission_order() {
        let published: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let published_in_handler = published.clone();
        let handler = move |messages: Vec<Envelope>| {
            let published = published_in_handler.clone();
            async move {
                for m in &messages {
                    published.lock().unwrap().push(m.message_id.clone());
                }
                Ok(())
            }
        };

        let ack = Arc::new(RecordingAckSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = SerializedQueue::new(
            context(Arc::new(handler), ack.clone(), shutdown_rx),
            8,
        );

        let d1 = queue.submit(batch(1, &["a1", "a2"])).await;
        let d2 = queue.submit(batch(2, &["b1"])).await;
        assert_eq!(d1.wait().await, DeliveryOutcome::Acknowledged);
        assert_eq!(d2.wait().await, DeliveryOutcome::Acknowledged);

        assert_eq!(*published.lock().unwrap(), vec!["a1", "a2", "b1"]);
        assert_eq!(*ack.acked.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn no_other_batch_is_published_while_one_retries() {
        struct FlakyFirst {
            batches_seen: StdMutex<Vec<u64>>,
        }

        #[async_trait]
        impl PublishHandler for FlakyFirst {
            async fn publish(&self, messages: Vec<Envelope>) -> anyhow::Result<()> {
                let commit = messages[0].position as u64 / 100;
                self.batches_seen.lock().unwrap().push(commit);
                if commit == 1 && messages[0].redelivery_count < 2 {
                    anyhow::bail!("flaky");
                }
                Ok(())
            }
        }

        let handler = Arc::new(FlakyFirst {
            batches_seen: StdMutex::new(Vec::new()),
        });
        let ack = Arc::new(RecordingAckSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = SerializedQueue::new(
            context(handler.clone(), ack.clone(), shutdown_rx),
            8,
        );

        let d1 = queue.submit(batch(1, &["m1"])).await;
        let d2 = queue.submit(batch(2, &["m2"])).await;
        d1.wait().await;
        d2.wait().await;

        // batch 2 never interleaves with batch 1's retries
        assert_eq!(*handler.batches_seen.lock().unwrap(), vec![1, 1, 1, 2]);
        assert_eq!(*ack.acked.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn close_drains_and_cancels_queued_batches() {
        let handler = |_: Vec<Envelope>| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        };
        let ack = Arc::new(RecordingAckSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = SerializedQueue::new(context(Arc::new(handler), ack, shutdown_rx), 8);

        let _d1 = queue.submit(batch(1, &["m1"])).await;
        let d2 = queue.submit(batch(2, &["m2"])).await;

        shutdown_tx.send(true).unwrap();
        queue.close().await;

        assert_eq!(d2.wait().await, DeliveryOutcome::Cancelled);
    }
}
