//! Outbound side of one WebSocket peer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::{ConnectionId, Envelope};
use courier_telemetry::metrics as m;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// Queue of serialized frames for a peer plus its heartbeat state. Shared
/// by the connection actor (sends), the socket writer (drains, pings) and
/// the socket reader (marks pongs).
pub struct ClientConnection {
    pub id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame. Returns `false` and counts a drop when the queue
    /// is full or the writer is gone.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            counter!(m::WS_SEND_DROPS_TOTAL).increment(1);
            warn!(connection_id = %self.id, "outbound queue full or closed, frame dropped");
            false
        }
    }

    /// Queue an envelope as a client frame (routing metadata stripped).
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<bool, serde_json::Error> {
        Ok(self.send(Arc::new(envelope.to_client_json()?)))
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn make_connection(capacity: usize) -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ClientConnection::new(ConnectionId::new(), tx), rx)
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection(4);
        assert!(conn.send(Arc::new("hello".into())));
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn send_to_full_channel_counts_drop() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(Arc::new("msg1".into())));
        assert!(!conn.send(Arc::new("msg2".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_to_closed_channel_returns_false() {
        let (conn, rx) = make_connection(4);
        drop(rx);
        assert!(!conn.send(Arc::new("hello".into())));
    }

    #[tokio::test]
    async fn envelope_is_sent_without_system() {
        let (conn, mut rx) = make_connection(4);
        let system = courier_core::SystemMeta::originate(&conn.id, &Default::default());
        let mut payload = serde_json::Map::new();
        payload.insert("text".into(), json!("hi"));
        let env = Envelope::new("chat.send", payload).with_system(system);

        assert!(conn.send_envelope(&env).unwrap());
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame, json!({"event": "chat.send", "payload": {"text": "hi"}}));
    }

    #[test]
    fn mark_alive_and_check() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn pong_elapsed_resets() {
        let (conn, _rx) = make_connection(1);
        std::thread::sleep(Duration::from_millis(10));
        assert!(conn.last_pong_elapsed() >= Duration::from_millis(10));
        conn.mark_alive();
        assert!(conn.last_pong_elapsed() < Duration::from_millis(10));
    }
}
