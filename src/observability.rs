use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "carrel_queries_total";

/// Histogram: command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "carrel_query_duration_seconds";

// ── Lifecycle metrics ────────────────────────────────────────────

/// Counter: reservations admitted (pending created).
pub const RESERVATIONS_CREATED_TOTAL: &str = "carrel_reservations_created_total";

/// Counter: requests diverted to the waitlist.
pub const RESERVATIONS_WAITLISTED_TOTAL: &str = "carrel_reservations_waitlisted_total";

/// Counter: waitlist entries promoted on approval.
pub const PROMOTIONS_TOTAL: &str = "carrel_promotions_total";

/// Counter: successful check-ins.
pub const CHECKINS_TOTAL: &str = "carrel_checkins_total";

/// Counter: reservations marked no_show (sweep or late scan).
pub const NO_SHOWS_MARKED_TOTAL: &str = "carrel_no_shows_marked_total";

/// Counter: check-in reminders sent.
pub const REMINDERS_SENT_TOTAL: &str = "carrel_reminders_sent_total";

/// Counter: push deliveries that failed (logged and swallowed).
pub const NOTIFY_FAILURES_TOTAL: &str = "carrel_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "carrel_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "carrel_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "carrel_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "carrel_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "carrel_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSpace { .. } => "insert_space",
        Command::UpdateSpace { .. } => "update_space",
        Command::DeleteSpace { .. } => "delete_space",
        Command::InsertUser { .. } => "insert_user",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::ApproveReservation { .. } => "approve_reservation",
        Command::RejectReservation { .. } => "reject_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::RescheduleReservation { .. } => "reschedule_reservation",
        Command::CheckIn { .. } => "check_in",
        Command::InsertFeedback { .. } => "insert_feedback",
        Command::SelectSpaces => "select_spaces",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectFeedback { .. } => "select_feedback",
        Command::SelectStats { .. } => "select_stats",
        Command::Listen { .. } => "listen",
    }
}
