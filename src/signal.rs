//! Termination-signal handling
//!
//! When `dispose_on_signal` is set, the consumer registers for the host's
//! termination signal and runs its own `stop` on receipt. Opt-in per
//! consumer; nothing here is process-global state.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Wait for SIGTERM/SIGINT (ctrl-c elsewhere) and invoke `stop`.
///
/// The listener also exits quietly when the consumer stops on its own, so a
/// restarted consumer can register a fresh one.
pub(crate) fn spawn_signal_listener<F, Fut>(
    stop: F,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = termination_signal() => {
                info!("termination signal received, stopping consumer");
                stop().await;
            }
            _ = shutdown.changed() => {}
        }
    })
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!("cannot install SIGTERM handler: {err}");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = term.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("cannot listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn listener_exits_when_the_consumer_stops_first() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_in_cb = stopped.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_signal_listener(
            move || {
                let stopped = stopped_in_cb.clone();
                async move {
                    stopped.store(true, Ordering::SeqCst);
                }
            },
            shutdown_rx,
        );

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener must exit with the consumer")
            .unwrap();
        assert!(!stopped.load(Ordering::SeqCst));
    }
}
