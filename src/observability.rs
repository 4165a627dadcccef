use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innledger_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (placed, unavailable, invalid, failed).
pub const RESERVATIONS_TOTAL: &str = "innledger_reservations_total";

pub const PAYMENTS_DECLINED_TOTAL: &str = "innledger_payments_declined_total";

// ── Expiry ──────────────────────────────────────────────────────

/// Counter: holds released by the expiry monitor.
pub const HOLDS_EXPIRED_TOTAL: &str = "innledger_holds_expired_total";

/// Counter: expiry attempts that failed for a reason other than a lost race.
pub const EXPIRY_FAILURES_TOTAL: &str = "innledger_expiry_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innledger_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innledger_wal_flush_batch_size";

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
        Command::InsertResource { .. } => "insert_resource",
        Command::ExtendInventory { .. } => "extend_inventory",
        Command::Reserve(_) => "reserve",
        Command::Confirm(_) => "confirm",
        Command::Cancel { .. } => "cancel",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectLedger { .. } => "select_ledger",
        Command::SelectResources => "select_resources",
    }
}
