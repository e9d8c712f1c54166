//! Periodic expiry sweep
//!
//! Expired entries are already dropped on access; the sweep reclaims the
//! ones nobody asks for again and trims the per-key sequence map.

use crate::coordinator::InvalidationCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Background task running `sweep` every interval
pub struct CacheSweeper {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl CacheSweeper {
    pub fn start(coordinator: Arc<InvalidationCoordinator>, interval: Duration, runtime: &Handle) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (entities, queries) = coordinator.sweep();
                        if entities + queries > 0 {
                            debug!(entities, queries, "Swept expired entries");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Cache sweeper shutting down");
                        break;
                    }
                }
            }
        });

        debug!(interval_ms = interval.as_millis() as u64, "Cache sweeper started");
        Self { shutdown_tx, task }
    }

    /// Stop the sweeper and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
