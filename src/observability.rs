use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "parkade_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "parkade_request_duration_seconds";

/// Counter: collaborator calls abandoned after the engine timeout. Labels: op.
pub const STORE_TIMEOUTS_TOTAL: &str = "parkade_store_timeouts_total";

// ── Business counters ───────────────────────────────────────────

/// Counter: stays opened.
pub const ENTRIES_TOTAL: &str = "parkade_entries_total";

/// Counter: stays closed.
pub const EXITS_TOTAL: &str = "parkade_exits_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkade_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkade_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkade_connections_rejected_total";

/// Counter: failed logins.
pub const AUTH_FAILURES_TOTAL: &str = "parkade_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkade_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkade_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const COMPACTIONS_TOTAL: &str = "parkade_compactions_total";

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

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Login { .. } => "login",
        Request::Entry { .. } => "entry",
        Request::Exit { .. } => "exit",
        Request::Current => "current",
        Request::History => "history",
        Request::Record { .. } => "record",
        Request::VehicleTypes => "vehicle_types",
        Request::CreateVehicleType { .. } => "create_vehicle_type",
        Request::UpdateVehicleType { .. } => "update_vehicle_type",
        Request::DeleteVehicleType { .. } => "delete_vehicle_type",
        Request::Users => "users",
        Request::CreateUser { .. } => "create_user",
        Request::UpdateUser { .. } => "update_user",
        Request::SetUserActive { .. } => "set_user_active",
        Request::DeleteUser { .. } => "delete_user",
        Request::UpdateUsername { .. } => "update_username",
        Request::Watch => "watch",
        Request::Ping => "ping",
    }
}
