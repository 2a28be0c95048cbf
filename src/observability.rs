use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: committed engine transactions. Labels: op.
pub const COMMITS_TOTAL: &str = "greenbox_commits_total";

// ── USE metrics (resource state) ────────────────────────────────

/// Gauge: boxes currently available.
pub const BOXES_AVAILABLE: &str = "greenbox_boxes_available";

/// Gauge: waitlist entries currently waiting.
pub const WAITLIST_WAITING: &str = "greenbox_waitlist_waiting";

/// Counter: notices delivered by the dispatcher. Labels: outcome.
pub const NOTICES_DELIVERED_TOTAL: &str = "greenbox_notices_delivered_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "greenbox_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "greenbox_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if `port`
/// is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
