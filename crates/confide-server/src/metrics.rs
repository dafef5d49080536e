//! Metrics collection and export for Confide.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use confide_core::RelayStats;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "confide_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "confide_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "confide_connections_rejected_total";
    pub const EVENTS_TOTAL: &str = "confide_events_total";
    pub const RELAY_ERRORS_TOTAL: &str = "confide_relay_errors_total";
    pub const INVALID_FRAMES_TOTAL: &str = "confide_invalid_frames_total";
    pub const PEERS_REGISTERED: &str = "confide_peers_registered";
    pub const PEERS_DETACHED: &str = "confide_peers_detached";
    pub const PENDING_EVICTIONS: &str = "confide_pending_evictions";
    pub const LATENCY_SECONDS: &str = "confide_latency_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused at the connection limit"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Signaling events by name and direction");
    metrics::describe_counter!(
        names::RELAY_ERRORS_TOTAL,
        "Rejected client events by error type"
    );
    metrics::describe_counter!(
        names::INVALID_FRAMES_TOTAL,
        "Inbound frames that could not be decoded"
    );
    metrics::describe_gauge!(names::PEERS_REGISTERED, "Peers attached to a connection");
    metrics::describe_gauge!(names::PEERS_DETACHED, "In-call peers awaiting reconnection");
    metrics::describe_gauge!(names::PENDING_EVICTIONS, "Scheduled grace evictions");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Event processing latency in seconds"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at the limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a signaling event.
pub fn record_event(name: &'static str, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => name, "direction" => direction).increment(1);
}

/// Record a rejected client event.
pub fn record_relay_error(kind: &'static str) {
    counter!(names::RELAY_ERRORS_TOTAL, "type" => kind).increment(1);
}

/// Record an undecodable inbound frame.
pub fn record_invalid_frame(encoding: &'static str) {
    counter!(names::INVALID_FRAMES_TOTAL, "encoding" => encoding).increment(1);
}

/// Record event processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Publish relay occupancy gauges.
pub fn set_relay_stats(stats: &RelayStats) {
    gauge!(names::PEERS_REGISTERED).set(stats.registry.attached_peers as f64);
    gauge!(names::PEERS_DETACHED).set(stats.registry.detached_peers as f64);
    gauge!(names::PENDING_EVICTIONS).set(stats.pending_evictions as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
