//! Lease reaper
//!
//! Background task that hands jobs with expired leases back to the queue and
//! drops finished jobs from memory once their retention window has passed.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::Queue;

/// Default period between two sweeps
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Starts the reaper; it sweeps every `interval` until `shutdown` fires
pub fn spawn_reaper(
    queue: Arc<Queue>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Lease reaper started (interval={interval:?})");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Lease reaper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let reclaimed = queue.reap_expired(now).await;
                    if reclaimed.is_empty() {
                        debug!("Lease sweep found nothing to reclaim");
                    } else {
                        info!("Lease sweep reclaimed {} job(s)", reclaimed.len());
                    }
                    queue.evict_finished(now);
                }
            }
        }
    })
}
