use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{now_ms, Engine};

/// Background task that marks overdue approved reservations as no-shows.
/// Reference policy: every 10 minutes.
pub async fn run_no_show_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let marked = engine.sweep_no_shows(now_ms()).await;
        if marked > 0 {
            info!("no-show sweep marked {marked} reservations");
        }
    }
}

/// Background task that sends check-in reminders for reservations starting
/// soon. Reference policy: every 5 minutes, 30-minute lead.
pub async fn run_reminder_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let sent = engine.sweep_reminders(now_ms()).await;
        if sent > 0 {
            info!("reminder sweep sent {sent} reminders");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
