//! Transport configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the HTTP/WebSocket listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `8000`, `0` auto-assigns).
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub send_queue: usize,
    /// Interval between server pings in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection that has not answered a ping for this long.
    pub pong_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            send_queue: 256,
            heartbeat_interval_secs: 30,
            pong_timeout_secs: 60,
            max_message_size: 1024 * 1024, // 1 MB
        }
    }
}
