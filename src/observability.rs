use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lessond_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lessond_query_duration_seconds";

// ── Booking core ────────────────────────────────────────────────

/// Counter: slot lists computed.
pub const SLOTS_COMPUTED_TOTAL: &str = "lessond_slots_computed_total";

/// Counter: reservation lock attempts. Labels: outcome (granted, denied).
pub const LOCK_ACQUISITIONS_TOTAL: &str = "lessond_lock_acquisitions_total";

/// Counter: confirm attempts. Labels: outcome (confirmed or failure kind).
pub const COMMITS_TOTAL: &str = "lessond_commits_total";

/// Histogram: confirm latency in seconds, lock wait included.
pub const COMMIT_DURATION_SECONDS: &str = "lessond_commit_duration_seconds";

/// Counter: expired reservation locks purged by the sweeper.
pub const LOCKS_SWEPT_TOTAL: &str = "lessond_locks_swept_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lessond_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lessond_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lessond_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "lessond_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lessond_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lessond_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertLock { .. } => "insert_lock",
        Command::DeleteLock { .. } => "delete_lock",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::TransitionBooking { .. } => "transition_booking",
        Command::InsertRule { .. } => "insert_rule",
        Command::DeleteRule { .. } => "delete_rule",
        Command::SelectRules { .. } => "select_rules",
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::InsertStudent { .. } => "insert_student",
        Command::SelectStudent { .. } => "select_student",
    }
}
