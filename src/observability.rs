use std::net::SocketAddr;

use crate::api::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "counsel_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "counsel_command_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: meeting requests created.
pub const REQUESTS_CREATED_TOTAL: &str = "counsel_requests_created_total";

/// Counter: terminal transitions applied. Labels: to.
pub const REQUEST_TRANSITIONS_TOTAL: &str = "counsel_request_transitions_total";

/// Counter: claim attempts that found the slot already taken.
pub const SLOT_CLAIM_CONFLICTS_TOTAL: &str = "counsel_slot_claim_conflicts_total";

/// Counter: claims released after the request write failed.
pub const CLAIM_ROLLBACKS_TOTAL: &str = "counsel_claim_rollbacks_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "counsel_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "counsel_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "counsel_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "counsel_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "counsel_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "counsel_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "counsel_wal_compactions_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::ListOpenSlots { .. } => "list_open_slots",
        Command::PublishSlot { .. } => "publish_slot",
        Command::RemoveSlot { .. } => "remove_slot",
        Command::CreateMeetingRequest { .. } => "create_meeting_request",
        Command::AcceptMeetingRequest { .. } => "accept_meeting_request",
        Command::RejectMeetingRequest { .. } => "reject_meeting_request",
        Command::ListCounselorRequests { .. } => "list_counselor_requests",
        Command::ListRequesterRequests { .. } => "list_requester_requests",
        Command::GetStats { .. } => "get_stats",
        Command::GetRequest { .. } => "get_request",
    }
}
