use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservations written. Labels: op (create, update).
pub const RESERVATIONS_TOTAL: &str = "courtside_reservations_total";

/// Counter: reservations cancelled.
pub const CANCELLATIONS_TOTAL: &str = "courtside_cancellations_total";

/// Counter: bookings rejected because a court was already taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "courtside_booking_conflicts_total";

/// Counter: waitlist offers created.
pub const WAITLIST_OFFERS_TOTAL: &str = "courtside_waitlist_offers_total";

/// Counter: post-commit side effects that failed. Labels: effect.
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "courtside_side_effect_failures_total";

// ── Background jobs ─────────────────────────────────────────────

/// Counter: open-play enforcement runs.
pub const ENFORCEMENT_RUNS_TOTAL: &str = "courtside_enforcement_runs_total";

/// Counter: facilities whose evaluation failed or timed out.
pub const ENFORCEMENT_FACILITY_FAILURES_TOTAL: &str = "courtside_enforcement_facility_failures_total";

/// Histogram: enforcement run duration in seconds.
pub const ENFORCEMENT_DURATION_SECONDS: &str = "courtside_enforcement_duration_seconds";

/// Counter: scheduled job runs that returned an error. Labels: job.
pub const JOB_FAILURES_TOTAL: &str = "courtside_job_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: facilities loaded in the registry.
pub const FACILITIES_ACTIVE: &str = "courtside_facilities_active";

/// Histogram: seconds to write and fsync one committed transaction.
pub const WAL_APPEND_DURATION_SECONDS: &str = "courtside_wal_append_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
