use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests handled. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "tourslot_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "tourslot_request_duration_seconds";

// ── Domain events ───────────────────────────────────────────────

/// Counter: edit-lock transitions. Labels: event
/// (acquired, renewed, released, expired, forced, rejected, forbidden).
pub const LOCK_EVENTS_TOTAL: &str = "tourslot_lock_events_total";

/// Counter: stale-revision rejections of a batch replace.
pub const REVISION_CONFLICTS_TOTAL: &str = "tourslot_revision_conflicts_total";

/// Counter: validator conflicts that blocked or skipped a write. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "tourslot_conflicts_total";

/// Counter: import rows by outcome (inserted, skipped, rejected).
pub const IMPORT_ROWS_TOTAL: &str = "tourslot_import_rows_total";

/// Counter: group-slots the allocator could not place.
pub const ALLOCATION_UNPLACED_TOTAL: &str = "tourslot_allocation_unplaced_total";

/// Counter: finished solver runs. Labels: status.
pub const SOLVER_RUNS_TOTAL: &str = "tourslot_solver_runs_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: solver runs waiting or running.
pub const SOLVER_QUEUE_DEPTH: &str = "tourslot_solver_queue_depth";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tourslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tourslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
