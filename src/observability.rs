use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "medsched_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "medsched_query_duration_seconds";

/// Counter: commands refused by the access policy. Labels: command.
pub const ACCESS_DENIED_TOTAL: &str = "medsched_access_denied_total";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: bookings written (single and batch).
pub const BOOKINGS_CREATED_TOTAL: &str = "medsched_bookings_created_total";

/// Counter: booking or reschedule attempts rejected by an overlap.
pub const BOOKING_CONFLICTS_TOTAL: &str = "medsched_booking_conflicts_total";

/// Counter: bookings moved to cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "medsched_bookings_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "medsched_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "medsched_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "medsched_connections_rejected_total";

/// Gauge: number of open clinics (loaded engines).
pub const TENANTS_ACTIVE: &str = "medsched_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "medsched_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "medsched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "medsched_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPractitioner { .. } => "insert_practitioner",
        Command::DeletePractitioner { .. } => "delete_practitioner",
        Command::InsertSubject { .. } => "insert_subject",
        Command::InsertBooking { .. } => "insert_booking",
        Command::BatchInsertBookings { .. } => "batch_insert_bookings",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertBookingStatus { .. } => "insert_booking_status",
        Command::InsertReschedule { .. } => "insert_reschedule",
        Command::InsertBookingNotes { .. } => "insert_booking_notes",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectPractitioners => "select_practitioners",
        Command::SelectSubjects => "select_subjects",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectAuditLog { .. } => "select_audit_log",
    }
}
