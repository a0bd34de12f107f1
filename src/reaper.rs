//! Idle-timeout reaper loop: a periodic tick, each tick a full scan,
//! stoppable via a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::manager::Manager;

/// Runs until `shutdown_rx` observes `true`. Ticks at the configured
/// `timeout_check_interval_minutes` (never less than one minute) rather
/// than busy-polling.
pub async fn run(manager: Arc<Manager>, interval_minutes: u64, mut shutdown_rx: watch::Receiver<bool>) {
    let interval_minutes = interval_minutes.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.reap_idle().await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("idle reaper shutting down");
                    break;
                }
            }
        }
    }
}
