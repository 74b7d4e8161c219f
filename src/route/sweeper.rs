//! Periodic eviction of routes that stopped heartbeating.
//!
//! The sweep runs every `timeout / 2`, so a dead backend stays routable for
//! at most 1.5× the timeout.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::route::registry::RouteRegistry;

/// Handle to a running sweep task.
pub struct Sweeper {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Sweeper {
    /// Start sweeping `registry` with the given heartbeat timeout.
    pub fn spawn(registry: RouteRegistry, timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweep_loop(registry, timeout, shutdown_rx));

        info!(
            timeout_ms = timeout.as_millis() as u64,
            interval_ms = sweep_interval(timeout).as_millis() as u64,
            "route sweeper started"
        );

        Self {
            handle,
            shutdown_tx,
        }
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
        debug!("route sweeper stopped");
    }
}

/// Sweep cadence for a heartbeat timeout.
pub fn sweep_interval(timeout: Duration) -> Duration {
    // tokio intervals panic on a zero period.
    (timeout / 2).max(Duration::from_millis(1))
}

async fn run_sweep_loop(
    registry: RouteRegistry,
    timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(sweep_interval(timeout));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately; nothing can be stale yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = registry.evict(timeout).await;
                if removed > 0 {
                    debug!(removed, "sweep evicted routes");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
