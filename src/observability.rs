use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotkeeper_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotkeeper_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: commit attempts. Labels: outcome (confirmed, slot_taken, timeout).
pub const COMMITS_TOTAL: &str = "slotkeeper_commits_total";

/// Counter: applied status transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "slotkeeper_transitions_total";

/// Counter: calendar pushes. Labels: outcome.
pub const SYNC_PUSHES_TOTAL: &str = "slotkeeper_sync_pushes_total";

/// Counter: notification jobs handed out. Labels: kind.
pub const NOTIFICATION_JOBS_TOTAL: &str = "slotkeeper_notification_jobs_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::UpsertConsultant { .. } => "upsert_consultant",
        Command::DeleteConsultant { .. } => "delete_consultant",
        Command::SelectConsultants => "select_consultants",
        Command::SetWorkingHours { .. } => "set_working_hours",
        Command::ClearWorkingHours { .. } => "clear_working_hours",
        Command::InsertBlackout { .. } => "insert_blackout",
        Command::DeleteBlackout { .. } => "delete_blackout",
        Command::SetOffline { .. } => "set_offline",
        Command::SetOnline { .. } => "set_online",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::Reschedule { .. } => "reschedule",
        Command::NoShow { .. } => "no_show",
        Command::CalendarChange(_) => "calendar_change",
        Command::RecordSync { .. } => "record_sync",
        Command::SelectSyncBacklog { .. } => "select_sync_backlog",
        Command::SelectDueNotifications { .. } => "select_due_notifications",
        Command::RunNotificationPass { .. } => "notification_pass",
        Command::SelectReconciliation => "select_reconciliation",
        Command::ResolveReconciliation { .. } => "resolve_reconciliation",
        Command::SelectBookingEvents { .. } => "select_booking_events",
    }
}
