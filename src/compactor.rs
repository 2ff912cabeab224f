use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::observability;
use crate::store::{Store, StoreError};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a tenant's WAL once enough appends pile up.
pub async fn run_compactor(
    store: Arc<dyn Store>,
    threshold: u64,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = compact_if_due(store.as_ref(), threshold).await {
            warn!("compaction failed: {e}");
        }
    }
    debug!("compactor stopped");
}

/// Compact when at least `threshold` appends happened since the last rewrite.
pub async fn compact_if_due(store: &dyn Store, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await;
    if appends < threshold.max(1) {
        return Ok(false);
    }
    store.compact().await?;
    metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL after {appends} appends");
    Ok(true)
}
