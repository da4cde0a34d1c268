use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that periodically removes expired claims and orphaned
/// bookings. Expired claims are already ignored by conflict checks; this only
/// keeps the slot tables small.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        // Non-blocking scan; take write locks only once something has expired.
        if !engine.collect_expired_slots(engine.now()).is_empty() {
            match engine.reclaim_expired().await {
                Ok(0) => {}
                Ok(n) => info!("reaped {n} expired reservation slots"),
                Err(e) => tracing::warn!("reaper: reclaim failed: {e}"),
            }
        }
        if let Err(e) = engine.discard_orphaned_bookings().await {
            tracing::warn!("reaper: orphan sweep failed: {e}");
        }
    }
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted journal after {appends} appends"),
            Err(e) => tracing::error!("journal compaction failed: {e}"),
        }
    }
}
