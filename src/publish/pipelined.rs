//! Pipelined publishing queue
//!
//! Overlaps a bounded number of publish calls while keeping acknowledgements
//! in commit order. Each submitted batch gets a sequence number; finished
//! batches land in a min-heap and an acknowledger task pops them only when
//! the head is the next sequence, so the acked position never skips a commit.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use super::{Delivery, DeliveryOutcome, PublishQueue, QueueContext, publish_with_retry};
use crate::message::TransactionBatch;

struct ReadyEntry {
    seq: u64,
    batch: TransactionBatch,
    published: bool,
    done: oneshot::Sender<DeliveryOutcome>,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

struct PipelineState {
    next_seq: u64,
    next_ack: u64,
    ready: BinaryHeap<Reverse<ReadyEntry>>,
}

/// Publishing queue with bounded concurrent publishes and ordered acks.
pub struct PipelinedQueue {
    ctx: Arc<QueueContext>,
    limiter: Arc<Semaphore>,
    state: Arc<StdMutex<PipelineState>>,
    ready_signal: Arc<Notify>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<JoinSet<()>>,
    acker: Mutex<Option<JoinHandle<()>>>,
}

impl PipelinedQueue {
    pub fn new(ctx: Arc<QueueContext>, max_in_flight: usize) -> Self {
        let state = Arc::new(StdMutex::new(PipelineState {
            next_seq: 0,
            next_ack: 0,
            ready: BinaryHeap::new(),
        }));
        let ready_signal = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        let acker = tokio::spawn(run_acker(
            ctx.clone(),
            state.clone(),
            ready_signal.clone(),
            closed.clone(),
        ));

        Self {
            ctx,
            limiter: Arc::new(Semaphore::new(max_in_flight.max(1))),
            state,
            ready_signal,
            closed,
            tasks: Mutex::new(JoinSet::new()),
            acker: Mutex::new(Some(acker)),
        }
    }
}

async fn run_acker(
    ctx: Arc<QueueContext>,
    state: Arc<StdMutex<PipelineState>>,
    ready_signal: Arc<Notify>,
    closed: Arc<AtomicBool>,
) {
    // Once one batch fails to settle, acking any later batch would leave a
    // gap in the acked sequence; everything after it cancels instead.
    let mut poisoned = false;
    loop {
        // Pop every entry that is next in sequence; an ack for batch N only
        // runs once every batch < N has been acknowledged.
        loop {
            let entry = {
                let mut state = state.lock().unwrap();
                match state.ready.peek() {
                    Some(Reverse(head)) if head.seq == state.next_ack => {
                        state.next_ack += 1;
                        state.ready.pop().map(|Reverse(entry)| entry)
                    }
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };

            let outcome = if entry.published && !poisoned {
                match ctx.ack.ack(&entry.batch).await {
                    Ok(()) => DeliveryOutcome::Acknowledged,
                    Err(_) => DeliveryOutcome::Cancelled,
                }
            } else {
                DeliveryOutcome::Cancelled
            };
            poisoned |= outcome == DeliveryOutcome::Cancelled;
            debug!(
                seq = entry.seq,
                commit_position = entry.batch.commit_position,
                ?outcome,
                "pipelined batch settled"
            );
            let _ = entry.done.send(outcome);
        }

        if closed.load(Ordering::SeqCst) {
            // Whatever is still parked out of order can no longer complete
            let mut state = state.lock().unwrap();
            while let Some(Reverse(entry)) = state.ready.pop() {
                let _ = entry.done.send(DeliveryOutcome::Cancelled);
            }
            break;
        }

        ready_signal.notified().await;
    }
    info!("pipelined publishing queue drained");
}

#[async_trait]
impl PublishQueue for PipelinedQueue {
    async fn submit(&self, batch: TransactionBatch) -> Delivery {
        if self.closed.load(Ordering::SeqCst) || *self.ctx.shutdown.borrow() {
            return Delivery::cancelled();
        }
        let Ok(permit) = self.limiter.clone().acquire_owned().await else {
            return Delivery::cancelled();
        };

        let (done, delivery) = Delivery::pair();
        let seq = {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };

        let ctx = self.ctx.clone();
        let state = self.state.clone();
        let ready_signal = self.ready_signal.clone();
        self.tasks.lock().await.spawn(async move {
            let mut batch = batch;
            let published = publish_with_retry(&ctx, &mut batch).await.is_ok();
            state.lock().unwrap().ready.push(Reverse(ReadyEntry {
                seq,
                batch,
                published,
                done,
            }));
            ready_signal.notify_one();
            drop(permit);
        });

        delivery
    }

    async fn close(&self) {
        self.limiter.close();

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        drop(tasks);

        self.closed.store(true, Ordering::SeqCst);
        self.ready_signal.notify_one();
        let acker = self.acker.lock().await.take();
        if let Some(acker) = acker {
            let _ = acker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as SyncMutex;
    use std::time::Duration;

    use tokio::sync::watch;

    use super::super::test_support::*;
    use super::*;
    use crate::message::Envelope;

    /// Handler whose completion order is driven by the test through gates.
    fn gated_handler(
        gates: Arc<SyncMutex<HashMap<u64, oneshot::Receiver<()>>>>,
        invocations: Arc<SyncMutex<Vec<u64>>>,
    ) -> impl super::super::PublishHandler {
        move |messages: Vec<Envelope>| {
            let gates = gates.clone();
            let invocations = invocations.clone();
            async move {
                let commit = messages[0].position as u64 / 100;
                invocations.lock().unwrap().push(commit);
                let gate = gates.lock().unwrap().remove(&commit);
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn acks_are_reordered_into_commit_order() {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for commit in 1..=3u64 {
            let (tx, rx) = oneshot::channel();
            senders.insert(commit, tx);
            receivers.insert(commit, rx);
        }

        let invocations = Arc::new(SyncMutex::new(Vec::new()));
        let handler = gated_handler(Arc::new(SyncMutex::new(receivers)), invocations.clone());
        let ack = Arc::new(RecordingAckSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = PipelinedQueue::new(context(Arc::new(handler), ack.clone(), shutdown_rx), 8);

        let d1 = queue.submit(batch(1, &["m1"])).await;
        let d2 = queue.submit(batch(2, &["m2"])).await;
        let d3 = queue.submit(batch(3, &["m3"])).await;

        // Complete the publishes out of order: 3, then 1, then 2.
        tokio::time::sleep(Duration::from_millis(20)).await;
        senders.remove(&3).unwrap().send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ack.acked.lock().unwrap().is_empty());

        senders.remove(&1).unwrap().send(()).unwrap();
        senders.remove(&2).unwrap().send(()).unwrap();

        assert_eq!(d1.wait().await, DeliveryOutcome::Acknowledged);
        assert_eq!(d2.wait().await, DeliveryOutcome::Acknowledged);
        assert_eq!(d3.wait().await, DeliveryOutcome::Acknowledged);
        assert_eq!(*ack.acked.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let mut receivers = HashMap::new();
        let mut senders = HashMap::new();
        for commit in 1..=3u64 {
            let (tx, rx) = oneshot::channel();
            senders.insert(commit, tx);
            receivers.insert(commit, rx);
        }

        let invocations = Arc::new(SyncMutex::new(Vec::new()));
        let handler = gated_handler(Arc::new(SyncMutex::new(receivers)), invocations.clone());
        let ack = Arc::new(RecordingAckSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(PipelinedQueue::new(
            context(Arc::new(handler), ack.clone(), shutdown_rx),
            2,
        ));

        let submitter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let d1 = queue.submit(batch(1, &["m1"])).await;
                let d2 = queue.submit(batch(2, &["m2"])).await;
                // blocks until a permit frees up
                let d3 = queue.submit(batch(3, &["m3"])).await;
                (d1, d2, d3)
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*invocations.lock().unwrap(), vec![1, 2]);

        senders.remove(&1).unwrap().send(()).unwrap();
        senders.remove(&2).unwrap().send(()).unwrap();
        senders.remove(&3).unwrap().send(()).unwrap();

        let (d1, d2, d3) = submitter.await.unwrap();
        assert_eq!(d1.wait().await, DeliveryOutcome::Acknowledged);
        assert_eq!(d2.wait().await, DeliveryOutcome::Acknowledged);
        assert_eq!(d3.wait().await, DeliveryOutcome::Acknowledged);
        assert_eq!(*ack.acked.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn shutdown_cancels_without_acking_out_of_order() {
        let mut receivers = HashMap::new();
        let mut senders = HashMap::new();
        for commit in 1..=2u64 {
            let (tx, rx) = oneshot::channel();
            senders.insert(commit, tx);
            receivers.insert(commit, rx);
        }

        let invocations = Arc::new(SyncMutex::new(Vec::new()));
        let handler = gated_handler(Arc::new(SyncMutex::new(receivers)), invocations);
        let ack = Arc::new(RecordingAckSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = PipelinedQueue::new(context(Arc::new(handler), ack.clone(), shutdown_rx), 8);

        let d1 = queue.submit(batch(1, &["m1"])).await;
        let d2 = queue.submit(batch(2, &["m2"])).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        // batch 2 finishes publishing, batch 1 never does before the stop
        senders.remove(&2).unwrap().send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown_tx.send(true).unwrap();
        senders.remove(&1).unwrap().send(()).unwrap();
        queue.close().await;

        assert_eq!(d1.wait().await, DeliveryOutcome::Cancelled);
        assert_eq!(d2.wait().await, DeliveryOutcome::Cancelled);
        assert!(ack.acked.lock().unwrap().is_empty());
    }
}
