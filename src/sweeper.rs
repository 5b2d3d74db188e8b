use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{Engine, SweepReport};
use crate::model::{now_ms, Ms, MINUTE_MS};
use crate::ports::MeetingProvider;

/// One pass of all three sweeps, in lifecycle order.
pub async fn sweep_once(engine: &Engine, provider: &dyn MeetingProvider, now: Ms) -> [SweepReport; 3] {
    let threshold_minutes = (engine.config.empty_room_threshold_ms / MINUTE_MS) as u32;
    let reports = [
        engine.run_not_started_sweep(now).await,
        engine.run_empty_room_sweep(provider, threshold_minutes, now).await,
        engine.run_timeout_sweep(provider, now).await,
    ];
    for (name, report) in ["not_started", "empty_room", "timeout"].iter().zip(&reports) {
        if report.processed > 0 || !report.errors.is_empty() {
            info!(
                "{name} sweep: processed={} completed={} errors={}",
                report.processed,
                report.completed,
                report.errors.len()
            );
        }
    }
    reports
}

/// Background task running every sweep on the configured interval.
pub async fn run_sweeper(engine: Arc<Engine>, provider: Arc<dyn MeetingProvider>) {
    let mut interval = tokio::time::interval(engine.config.sweep_interval);
    loop {
        interval.tick().await;
        sweep_once(&engine, provider.as_ref(), now_ms()).await;
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
            Ok(()) => info!("journal compacted after {appends} appends"),
            Err(e) => warn!("journal compaction failed: {e:?}"),
        }
    }
}

/// Spawn the sweeper and compactor for `engine`.
pub fn spawn(engine: Arc<Engine>, provider: Arc<dyn MeetingProvider>) -> (JoinHandle<()>, JoinHandle<()>) {
    let threshold = engine.config.compact_threshold;
    let sweeper = tokio::spawn(run_sweeper(engine.clone(), provider));
    let compactor = tokio::spawn(run_compactor(engine, threshold));
    (sweeper, compactor)
}
