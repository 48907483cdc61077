use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "clinic_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "clinic_query_duration_seconds";

/// Counter: appointment requests turned away. Labels: reason.
pub const APPOINTMENTS_REJECTED_TOTAL: &str = "clinic_appointments_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "clinic_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "clinic_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "clinic_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "clinic_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "clinic_wal_flush_batch_size";

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
        Command::InsertDoctor(_) => "insert_doctor",
        Command::InsertPatient(_) => "insert_patient",
        Command::InsertRoom { .. } => "insert_room",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::SelectDoctors { .. } => "select_doctors",
        Command::SelectPatients { .. } => "select_patients",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::DeleteDoctors { .. } => "delete_doctors",
        Command::DeletePatients { .. } => "delete_patients",
        Command::DeleteRooms { .. } => "delete_rooms",
        Command::DeleteAppointments { .. } => "delete_appointments",
    }
}
