use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::locks::ReservationLockManager;

const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(30);

/// Periodically drop expired reservation locks. Expired locks are already
/// invisible to acquire and commit; this only reclaims memory.
pub async fn run_lock_sweeper(locks: Arc<ReservationLockManager>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => {
                debug!("lock sweeper stopping");
                return;
            }
        }
        match locks.purge_expired_at(now_ms()).await {
            Ok(0) => {}
            Ok(n) => {
                metrics::counter!(crate::observability::LOCKS_SWEPT_TOTAL).increment(n as u64);
                debug!("swept {n} expired reservation locks");
            }
            Err(e) => warn!("lock sweep failed: {e}"),
        }
    }
}

/// Compact the tenant's WAL once enough appends pile up. Exits when the
/// engine is dropped.
pub async fn run_compactor(engine: Weak<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_PERIOD);
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(tenant = %engine.tenant().id, "compacted WAL"),
            Err(e) => warn!(tenant = %engine.tenant().id, "WAL compaction failed: {e}"),
        }
    }
}
