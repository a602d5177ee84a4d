//! Auxiliary polling outbox
//!
//! An independent loop that delivers from the secondary outbox without
//! relying on the upstream log. Rows are selected oldest first, handed to the
//! same publish callback as primary traffic, and flagged delivered in place.
//! Non-critical traffic only; at-least-once still holds.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{AuxiliaryOptions, Clock, ErrorCallback};
use crate::errors::OutboxResult;
use crate::message::Envelope;
use crate::publish::PublishHandler;

/// One undelivered row of the secondary outbox
#[derive(Debug, Clone)]
pub struct AuxiliaryRow {
    pub position: i64,
    pub message_id: String,
    pub message_type: String,
    pub data: serde_json::Value,
    pub fails_count: u32,
    pub added_at: DateTime<Utc>,
}

/// Storage operations the polling loop needs.
///
/// Rows are created by `send` and mutated only here: the delivered flag flips
/// to true with a `sent_at` stamp, or the failure counter grows. Rows are
/// never deleted.
#[async_trait]
pub trait AuxiliaryStore: Send + Sync {
    /// Up to `limit` undelivered rows, oldest `added_at` first.
    async fn fetch_undelivered(&self, limit: i64) -> OutboxResult<Vec<AuxiliaryRow>>;

    async fn mark_delivered(&self, position: i64, sent_at: DateTime<Utc>) -> OutboxResult<()>;

    async fn mark_failed(&self, position: i64) -> OutboxResult<()>;
}

/// The polling loop; one per consumer that enabled the auxiliary outbox.
pub(crate) struct AuxiliaryWorker {
    pub store: Arc<dyn AuxiliaryStore>,
    pub handler: Arc<dyn PublishHandler>,
    pub options: AuxiliaryOptions,
    pub partition_key: String,
    pub on_failed_publish: ErrorCallback,
    pub on_db_error: ErrorCallback,
    pub now: Clock,
    pub shutdown: watch::Receiver<bool>,
}

impl AuxiliaryWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            check_interval = ?self.options.check_interval,
            batch_limit = self.options.batch_limit,
            "auxiliary polling loop started"
        );

        let mut ticker = tokio::time::interval(self.options.check_interval);
        // A tick that fires while the previous cycle is still running is
        // dropped, not queued; cycles never overlap.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("auxiliary polling loop stopped");
    }

    async fn tick(&self) {
        let rows = match self.store.fetch_undelivered(self.options.batch_limit).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("auxiliary fetch failed: {err}");
                (self.on_db_error)(&err);
                return;
            }
        };
        if rows.is_empty() {
            return;
        }
        debug!(rows = rows.len(), "auxiliary tick");

        for row in rows {
            if *self.shutdown.borrow() {
                return;
            }
            self.deliver(row).await;
        }
    }

    async fn deliver(&self, row: AuxiliaryRow) {
        let position = row.position;
        let envelope = Envelope {
            position,
            message_id: row.message_id,
            message_type: row.message_type,
            partition_key: self.partition_key.clone(),
            redelivery_count: row.fails_count,
            source_position: None,
            data: row.data,
        };

        match self.handler.publish(vec![envelope]).await {
            Ok(()) => {
                let sent_at = (self.now)();
                if let Err(err) = self.store.mark_delivered(position, sent_at).await {
                    warn!(position, "failed to flag auxiliary row delivered: {err}");
                    (self.on_db_error)(&err);
                }
            }
            Err(err) => {
                let publish_err = crate::errors::OutboxError::Publish(err);
                (self.on_failed_publish)(&publish_err);
                if let Err(err) = self.store.mark_failed(position).await {
                    warn!(position, "failed to bump auxiliary failure count: {err}");
                    (self.on_db_error)(&err);
                }
                // Brief pause so a broken downstream is not hammered
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(self.options.wait_after_failed_publish) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::errors::OutboxError;
    use serde_json::json;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<(AuxiliaryRow, bool, Option<DateTime<Utc>>)>>,
    }

    impl MemoryStore {
        fn push(&self, position: i64, message_id: &str) {
            self.rows.lock().unwrap().push((
                AuxiliaryRow {
                    position,
                    message_id: message_id.to_string(),
                    message_type: "Compensate".into(),
                    data: json!({"x": 1}),
                    fails_count: 0,
                    added_at: Utc::now(),
                },
                false,
                None,
            ));
        }
    }

    #[async_trait]
    impl AuxiliaryStore for MemoryStore {
        async fn fetch_undelivered(&self, limit: i64) -> OutboxResult<Vec<AuxiliaryRow>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|(_, delivered, _)| !delivered)
                .take(limit as usize)
                .map(|(row, _, _)| row.clone())
                .collect())
        }

        async fn mark_delivered(&self, position: i64, sent_at: DateTime<Utc>) -> OutboxResult<()> {
            let mut rows = self.rows.lock().unwrap();
            let entry = rows
                .iter_mut()
                .find(|(row, _, _)| row.position == position)
                .ok_or_else(|| OutboxError::storage("row vanished"))?;
            entry.1 = true;
            entry.2 = Some(sent_at);
            Ok(())
        }

        async fn mark_failed(&self, position: i64) -> OutboxResult<()> {
            let mut rows = self.rows.lock().unwrap();
            let entry = rows
                .iter_mut()
                .find(|(row, _, _)| row.position == position)
                .ok_or_else(|| OutboxError::storage("row vanished"))?;
            entry.0.fails_count += 1;
            Ok(())
        }
    }

    fn worker(
        store: Arc<MemoryStore>,
        handler: Arc<dyn PublishHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> AuxiliaryWorker {
        AuxiliaryWorker {
            store,
            handler,
            options: AuxiliaryOptions {
                check_interval: Duration::from_millis(10),
                batch_limit: 10,
                wait_after_failed_publish: Duration::from_millis(5),
            },
            partition_key: "default".into(),
            on_failed_publish: Arc::new(|_| {}),
            on_db_error: Arc::new(|_| {}),
            now: Arc::new(Utc::now),
            shutdown,
        }
    }

    #[tokio::test]
    async fn delivers_and_stamps_rows() {
        let store = Arc::new(MemoryStore::default());
        store.push(1, "c1");
        store.push(2, "c2");

        let delivered: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let delivered_in_handler = delivered.clone();
        let handler = move |messages: Vec<Envelope>| {
            let delivered = delivered_in_handler.clone();
            async move {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].redelivery_count, 0);
                delivered.lock().unwrap().push(messages[0].message_id.clone());
                Ok(())
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = worker(store.clone(), Arc::new(handler), shutdown_rx).spawn();

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*delivered.lock().unwrap(), vec!["c1", "c2"]);
        let rows = store.rows.lock().unwrap();
        assert!(rows.iter().all(|(_, delivered, sent_at)| *delivered && sent_at.is_some()));
    }

    #[tokio::test]
    async fn failures_bump_the_counter_and_keep_the_row() {
        let store = Arc::new(MemoryStore::default());
        store.push(1, "c1");

        let attempts: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let attempts_in_handler = attempts.clone();
        let handler = move |messages: Vec<Envelope>| {
            let attempts = attempts_in_handler.clone();
            async move {
                attempts.lock().unwrap().push(messages[0].redelivery_count);
                if messages[0].redelivery_count < 2 {
                    anyhow::bail!("downstream refused");
                }
                Ok(())
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = worker(store.clone(), Arc::new(handler), shutdown_rx).spawn();

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // redelivery count mirrors the persisted failure count on every attempt
        assert_eq!(&attempts.lock().unwrap()[..3], &[0, 1, 2]);
        let rows = store.rows.lock().unwrap();
        assert!(rows[0].1);
        assert_eq!(rows[0].0.fails_count, 2);
    }
}
