//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    pub consumer: String,
    pub group: Option<String>,
    /// Client-sendable event kinds.
    pub events: usize,
}

pub fn health_check(
    start_time: Instant,
    connections: usize,
    consumer: &str,
    group: Option<&str>,
    events: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        consumer: consumer.to_owned(),
        group: group.map(str::to_owned),
        events,
    }
}
