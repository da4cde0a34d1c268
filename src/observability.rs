use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetslot_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: slot claims. Labels: outcome (claimed, conflict).
pub const CLAIMS_TOTAL: &str = "fleetslot_claims_total";

/// Counter: booking attempts. Labels: outcome (created, conflict, failed, cancelled).
pub const BOOKINGS_TOTAL: &str = "fleetslot_bookings_total";

/// Counter: compensation steps run after a failed booking. Labels: step, outcome.
pub const COMPENSATIONS_TOTAL: &str = "fleetslot_compensations_total";

/// Counter: expired claims removed by reclamation.
pub const SLOTS_RECLAIMED_TOTAL: &str = "fleetslot_slots_reclaimed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetslot_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::SelectVehicles { .. } => "select_vehicles",
        Command::SelectAvailableVehicles { .. } => "select_available_vehicles",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectSlots { .. } => "select_slots",
    }
}
