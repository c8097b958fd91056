//! Prometheus recorder and metric names shared across crates.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// The returned handle renders the `/metrics` endpoint. Fails if another
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_seconds".into()),
            &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        )?
        .install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections refused by the auth gate (counter).
pub const WS_CONNECTIONS_REFUSED_TOTAL: &str = "ws_connections_refused_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Outbound frames dropped because a send queue was full (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Inbound client frames accepted for dispatch (counter, labels: event).
pub const EVENTS_RECEIVED_TOTAL: &str = "events_received_total";
/// Envelopes published to a group (counter, labels: event).
pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";
/// Error envelopes sent to peers (counter, labels: kind).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Unclassified processing faults (counter).
pub const PROCESSING_ERRORS_TOTAL: &str = "processing_errors_total";
/// Session snapshots that could not be written (counter).
pub const SESSION_CACHE_ERRORS_TOTAL: &str = "session_cache_errors_total";
/// Routing passes evaluated (counter, labels: event).
pub const ROUTING_PASSES_TOTAL: &str = "routing_passes_total";
/// Routing pass duration (histogram).
pub const ROUTING_PASS_DURATION_SECONDS: &str = "routing_pass_duration_seconds";
