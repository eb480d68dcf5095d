//! Periodic indexer trigger
//!
//! Runs `Indexer::sync` on a fixed interval until cancelled. Each tick is an
//! independent, idempotent invocation; a failed tick is logged and the next
//! one resumes from the persisted cursor.

use crate::error::IndexerError;
use crate::indexer::Indexer;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Counters for the lifetime of one scheduler loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped_busy: u64,
}

/// Sync on every tick of `poll_interval_ms` until `cancel` fires
///
/// The first tick fires immediately. Cancellation interrupts the wait between
/// ticks and is passed through to the running sync, which stops at its next
/// window boundary.
pub async fn run_indexer_loop(
    indexer: Arc<Indexer>,
    poll_interval_ms: u64,
    cancel: CancellationToken,
) -> SchedulerStats {
    log::info!("⏰ Starting indexer loop (interval: {}ms)", poll_interval_ms);

    let mut timer = interval(Duration::from_millis(poll_interval_ms.max(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats = SchedulerStats::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        stats.ticks += 1;
        match indexer.sync_with_cancel(&cancel).await {
            Ok(report) => {
                stats.succeeded += 1;
                if report.windows_committed > 0 {
                    log::info!(
                        "✅ Sync #{}: {} new events, cursor at {} (head {})",
                        stats.ticks,
                        report.events_inserted,
                        report.cursor,
                        report.target_height
                    );
                } else {
                    log::debug!("Sync #{}: up to date at block {}", stats.ticks, report.cursor);
                }
            }
            Err(IndexerError::Busy { key }) => {
                stats.skipped_busy += 1;
                log::info!("⏸️  Sync #{} skipped, cursor {} busy", stats.ticks, key);
            }
            Err(e) => {
                stats.failed += 1;
                log::error!("❌ Sync #{} failed: {}", stats.ticks, e);
            }
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    log::info!(
        "🛑 Indexer loop stopped after {} tick(s) ({} ok, {} failed, {} busy)",
        stats.ticks,
        stats.succeeded,
        stats.failed,
        stats.skipped_busy
    );
    stats
}
