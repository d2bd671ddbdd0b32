//! Periodic expiry of messages that never received a final report

use super::TrackerHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Ask the tracker to expire overdue messages every `period` until shutdown
pub async fn run_sweeper(
    tracker: TrackerHandle,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period_secs = period.as_secs(), "Expiry sweeper started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow_and_update() {
                    info!("Expiry sweeper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                match tracker.sweep_expired().await {
                    Ok(count) => debug!(count, "Expiry sweep finished"),
                    Err(e) => error!("Error sweeping expired messages: {}", e),
                }
            }
        }
    }
}
