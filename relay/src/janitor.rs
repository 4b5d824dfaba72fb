//! Idle session eviction.
//!
//! Runs on a fixed interval, independent of request traffic. Eviction only
//! unregisters the session and releases its channel; a stream that is still
//! attached finishes writing whatever was queued and then ends.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::{CloseReason, SessionRegistry};

/// Handle to the running janitor task.
pub struct Janitor {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Janitor {
    /// Start the janitor task.
    pub fn start(registry: SessionRegistry, idle_timeout: Duration, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            Self::run(registry, idle_timeout, interval, shutdown_rx).await;
        });
        info!(
            idle_timeout_secs = idle_timeout.as_secs(),
            interval_secs = interval.as_secs(),
            "Session janitor started"
        );
        Self { shutdown_tx, task }
    }

    /// Stop the janitor and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }

    async fn run(
        registry: SessionRegistry,
        idle_timeout: Duration,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Session janitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    Self::sweep(&registry, idle_timeout).await;
                }
            }
        }
    }

    /// Evict every session idle for longer than `idle_timeout`.
    pub async fn sweep(registry: &SessionRegistry, idle_timeout: Duration) -> usize {
        let expired: Vec<(String, Duration)> = registry
            .all_active()
            .await
            .into_iter()
            .filter_map(|session| {
                let idle = session.idle_for();
                (idle > idle_timeout).then(|| (session.id().to_string(), idle))
            })
            .collect();

        let mut evicted = 0;
        for (id, idle) in expired {
            if registry.remove(&id, CloseReason::IdleTimeout).await {
                info!(
                    session_id = %id,
                    idle_secs = idle.as_secs(),
                    "Evicted idle session"
                );
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = registry.session_count(), "Janitor sweep done");
        }
        evicted
    }
}
