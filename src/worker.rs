use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::TtlCache;
use crate::models::CachedResponse;
use crate::rate_limit::RateLimiter;

// Background sweeper - drops finished rate-limit windows and expired cache entries
pub async fn sweep_worker(
    limiter: Arc<RateLimiter>,
    cache: Arc<TtlCache<CachedResponse>>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval = ?sweep_interval, "Sweep worker started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let windows = limiter.sweep_expired();
        let entries = cache.sweep_expired();
        if windows > 0 || entries > 0 {
            debug!(
                windows,
                cache_entries = entries,
                remaining_windows = limiter.len(),
                "Swept expired state"
            );
        }
    }

    info!("Sweep worker stopped");
}
