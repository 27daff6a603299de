use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "drivealive_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "drivealive_query_duration_seconds";

/// Counter: slot generation requests served.
pub const SLOT_QUERIES_TOTAL: &str = "drivealive_slot_queries_total";

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "drivealive_bookings_created_total";

/// Counter: booking attempts refused. Labels: reason.
pub const BOOKING_CONFLICTS_TOTAL: &str = "drivealive_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "drivealive_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "drivealive_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "drivealive_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "drivealive_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "drivealive_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertInstructor { .. } => "insert_instructor",
        Command::DeleteInstructor { .. } => "delete_instructor",
        Command::InsertScheduleEntry { .. } => "insert_schedule",
        Command::DeleteScheduleEntry { .. } => "delete_schedule",
        Command::InsertTimeOff { .. } => "insert_time_off",
        Command::DeleteTimeOff { .. } => "delete_time_off",
        Command::InsertCustomAvailability { .. } => "insert_custom_availability",
        Command::DeleteCustomAvailability { .. } => "delete_custom_availability",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectInstructors => "select_instructors",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectTimeOff { .. } => "select_time_off",
        Command::SelectCustomAvailability { .. } => "select_custom_availability",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailableSlots { .. } => "select_available_slots",
    }
}
