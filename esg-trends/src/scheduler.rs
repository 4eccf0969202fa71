//! Periodic refresh timer
//!
//! Drives `refresh_trends(false)` at a fixed interval. The first tick fires
//! immediately so a freshly started service publishes without waiting a
//! full interval. Manual refreshes and timer ticks enter the same cycle
//! logic and coalesce with each other.

use crate::service::TrendService;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn the refresh loop; it stops when `shutdown` is cancelled
pub fn spawn_refresh_timer(
    service: TrendService,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Refresh timer started (every {:?})", interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Refresh timer stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = service.refresh_trends(false).await;
                    debug!(
                        tier = %outcome.source,
                        trends = outcome.trends.len(),
                        "Timer refresh complete"
                    );
                }
            }
        }
    })
}
