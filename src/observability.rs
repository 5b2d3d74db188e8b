use std::net::SocketAddr;

// ── Request-driven ──────────────────────────────────────────────

/// Counter: lessons booked.
pub const LESSONS_BOOKED_TOTAL: &str = "lessond_lessons_booked_total";

/// Counter: booking attempts rejected. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "lessond_bookings_rejected_total";

/// Counter: applied status transitions. Labels: to, role.
pub const STATUS_TRANSITIONS_TOTAL: &str = "lessond_status_transitions_total";

/// Counter: package hours returned to students.
pub const HOURS_REFUNDED_TOTAL: &str = "lessond_hours_refunded_total";

// ── Sweeps ──────────────────────────────────────────────────────

/// Counter: lessons touched by sweeps. Labels: sweep, outcome.
pub const SWEEP_LESSONS_TOTAL: &str = "lessond_sweep_lessons_total";

/// Histogram: sweep pass duration in seconds. Labels: sweep.
pub const SWEEP_DURATION_SECONDS: &str = "lessond_sweep_duration_seconds";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lessond_wal_flush_duration_seconds";

/// Histogram: records per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "lessond_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// fmt subscriber filtered by `RUST_LOG` (default `info`). Later calls are ignored.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
