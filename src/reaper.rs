use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};
use crate::model::Ms;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// One sweep: cancel lapsed soft holds, then drop old terminal reservations.
pub async fn sweep_once(engine: &Engine, now: Ms, retention: Ms) {
    match engine.expire_soft_holds(now).await {
        Ok(expired) if !expired.is_empty() => info!("expired {} soft hold(s)", expired.len()),
        Ok(_) => {}
        Err(e) => warn!("soft hold sweep failed: {e}"),
    }
    match engine.gc_terminal_reservations(now, retention).await {
        Ok(0) => {}
        Ok(n) => debug!("gc dropped {n} terminal reservation(s)"),
        Err(e) => warn!("terminal reservation gc failed: {e}"),
    }
}

/// Periodic expiry sweep and GC until `shutdown` fires.
pub async fn run_reaper(
    engine: Arc<Engine>,
    every: Duration,
    retention: Ms,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => sweep_once(&engine, now_ms(), retention).await,
        }
    }
    debug!("reaper stopped");
}

/// Compact the log whenever enough appends have piled up since the last run.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends >= threshold {
                    match engine.compact_wal().await {
                        Ok(()) => info!("compacted WAL after {appends} append(s)"),
                        Err(e) => warn!("WAL compaction failed: {e}"),
                    }
                }
            }
        }
    }
    debug!("compactor stopped");
}
