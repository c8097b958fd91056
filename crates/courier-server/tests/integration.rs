//! End-to-end tests using real WebSocket clients.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use courier_core::{Field, Payload, RawPayload, Shape, TargetClass, User};
use courier_routing::{EventHandler, HookError, HookResult, Outbox, Reply, RoutingMessage};
use courier_server::config::ServerConfig;
use courier_server::{Consumer, CourierServer, Lifecycle, LifecycleContext, Services};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

// ── Handlers ──

#[derive(Debug, Serialize, Deserialize)]
struct Text {
    text: String,
}

impl Payload for Text {
    const SHAPE: Shape = Shape::closed("Text", &[Field::required("text")]);
}

#[derive(Debug, Serialize, Deserialize)]
struct Addressed {
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to_username: Option<String>,
}

impl Payload for Addressed {
    const SHAPE: Shape = Shape::closed(
        "Addressed",
        &[
            Field::required("text"),
            Field::optional("to_user_id"),
            Field::optional("to_username"),
        ],
    );
}

/// Echoed to every member.
struct Shout;

#[async_trait]
impl EventHandler for Shout {
    const NAME: &'static str = "Shout";
    type Request = Text;
    type InitiatorReply = RawPayload;
    type TargetReply = Text;

    async fn target_catch(
        &self,
        msg: &RoutingMessage<Text>,
        _out: &dyn Outbox,
    ) -> HookResult<Text> {
        Ok(Some(Reply::Echo(Text {
            text: msg.payload.text.clone(),
        })))
    }
}

/// Echoed to the sender only; used as a join handshake.
struct Ready;

#[async_trait]
impl EventHandler for Ready {
    const NAME: &'static str = "Ready";
    const TARGET: TargetClass = TargetClass::ForInitiator;
    type Request = RawPayload;
    type InitiatorReply = RawPayload;
    type TargetReply = RawPayload;

    async fn target_catch(
        &self,
        _msg: &RoutingMessage<RawPayload>,
        _out: &dyn Outbox,
    ) -> HookResult<RawPayload> {
        Ok(Some(Reply::Echo(RawPayload::default())))
    }
}

/// Delivered to the addressed user only.
struct Whisper;

#[async_trait]
impl EventHandler for Whisper {
    const NAME: &'static str = "Whisper";
    const TARGET: TargetClass = TargetClass::ForUser;
    type Request = Addressed;
    type InitiatorReply = RawPayload;
    type TargetReply = Text;

    async fn before_catch(
        &self,
        msg: &RoutingMessage<Addressed>,
        _out: &dyn Outbox,
    ) -> Result<(), HookError> {
        msg.ensure_recipient_not_initiator()
    }

    async fn target_catch(
        &self,
        msg: &RoutingMessage<Addressed>,
        _out: &dyn Outbox,
    ) -> HookResult<Text> {
        Ok(Some(Reply::Echo(Text {
            text: msg.payload.text.clone(),
        })))
    }
}

/// Counts `before_disconnect` calls.
struct Departures(Arc<AtomicUsize>);

#[async_trait]
impl Lifecycle for Departures {
    async fn before_disconnect(&self, _ctx: &LifecycleContext<'_>) -> Result<(), HookError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Harness ──

fn consumer(require_auth: bool) -> Consumer {
    Consumer::builder("test")
        .group("room")
        .require_auth(require_auth)
        .event(Shout)
        .event(Ready)
        .event(Whisper)
        .build()
}

async fn boot(consumer: Consumer) -> (SocketAddr, CourierServer) {
    let (addr, server, _handle) = serve(consumer).await;
    (addr, server)
}

async fn serve(consumer: Consumer) -> (SocketAddr, CourierServer, JoinHandle<()>) {
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let services = Services::in_memory(vec![User::new(1, "ada"), User::new(2, "bob")]);
    let server = CourierServer::new(config, consumer, services);
    let (addr, handle) = server.listen().await.unwrap();
    (addr, server, handle)
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn expect_silence(ws: &mut WsStream) {
    let next = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "expected no frame, got {next:?}");
}

/// Connect and wait until the connection has joined its group.
async fn connect(addr: SocketAddr, path: &str) -> WsStream {
    let (mut ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    send_json(&mut ws, json!({"event": "ready", "payload": {}})).await;
    assert_eq!(read_json(&mut ws).await["event"], "ready");
    ws
}

// ── Tests ──

#[tokio::test]
async fn broadcast_reaches_every_member() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;
    let mut bob = connect(addr, "/ws/2").await;

    send_json(&mut ada, json!({"event": "shout", "payload": {"text": "hello"}})).await;

    let expected = json!({"event": "shout", "payload": {"text": "hello"}});
    assert_eq!(read_json(&mut ada).await, expected);
    assert_eq!(read_json(&mut bob).await, expected);
}

#[tokio::test]
async fn outbound_frames_carry_no_routing_metadata() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;

    send_json(&mut ada, json!({"event": "shout", "payload": {"text": "x"}})).await;
    let frame = read_json(&mut ada).await;
    assert!(frame.get("system").is_none());
}

#[tokio::test]
async fn unknown_event_errors_only_the_sender() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;
    let mut bob = connect(addr, "/ws/2").await;

    send_json(&mut ada, json!({"event": "dance", "payload": {}})).await;

    let err = read_json(&mut ada).await;
    assert_eq!(err["event"], "error.action_not_exist");
    assert_eq!(err["payload"]["message"], "Action not exist");
    expect_silence(&mut bob).await;
}

#[tokio::test]
async fn signature_errors_name_the_field() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;

    send_json(&mut ada, json!({"event": "shout", "payload": {}})).await;
    let err = read_json(&mut ada).await;
    assert_eq!(err["event"], "error.payload_signature_wrong");
    assert_eq!(err["payload"]["required"], "text");

    send_json(&mut ada, json!({"event": "shout", "payload": {"text": "a", "volume": 11}})).await;
    let err = read_json(&mut ada).await;
    assert_eq!(err["event"], "error.action_signature_wrong");
    assert_eq!(err["payload"]["unexpected"], "volume");
}

#[tokio::test]
async fn direct_message_reaches_only_the_recipient() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;
    let mut bob = connect(addr, "/ws/2").await;

    send_json(
        &mut ada,
        json!({"event": "whisper", "payload": {"text": "psst", "to_username": "bob"}}),
    )
    .await;

    assert_eq!(
        read_json(&mut bob).await,
        json!({"event": "whisper", "payload": {"text": "psst"}})
    );
    expect_silence(&mut ada).await;
}

#[tokio::test]
async fn direct_message_to_unknown_user() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;
    let mut bob = connect(addr, "/ws/2").await;

    send_json(
        &mut ada,
        json!({"event": "whisper", "payload": {"text": "psst", "to_user_id": 99}}),
    )
    .await;

    assert_eq!(read_json(&mut ada).await["event"], "error.recipient_not_exist");
    expect_silence(&mut bob).await;
}

#[tokio::test]
async fn direct_message_to_self_is_refused() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;

    send_json(
        &mut ada,
        json!({"event": "whisper", "payload": {"text": "me", "to_user_id": 1}}),
    )
    .await;

    let err = read_json(&mut ada).await;
    assert_eq!(err["event"], "error.recipient_is_me");
    assert_eq!(err["payload"]["message"], "You cannot be the recipient");
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;

    ada.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(read_json(&mut ada).await["event"], "error");

    send_json(&mut ada, json!({"event": "shout", "payload": {"text": "still here"}})).await;
    assert_eq!(read_json(&mut ada).await["payload"]["text"], "still here");
}

#[tokio::test]
async fn binary_utf8_frames_are_accepted() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;

    let frame = json!({"event": "shout", "payload": {"text": "bin"}}).to_string();
    ada.send(Message::Binary(frame.into_bytes().into())).await.unwrap();
    assert_eq!(read_json(&mut ada).await["payload"]["text"], "bin");
}

#[tokio::test]
async fn anonymous_connections_are_refused_when_auth_required() {
    let (addr, _server) = boot(consumer(true)).await;

    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/ws/77")).await.is_err());
    let _ada = connect(addr, "/ws/1").await;
}

#[tokio::test]
async fn anonymous_connections_route_by_connection() {
    let (addr, _server) = boot(consumer(false)).await;
    let mut anon = connect(addr, "/ws").await;
    let mut ada = connect(addr, "/ws/1").await;

    send_json(&mut anon, json!({"event": "shout", "payload": {"text": "hi"}})).await;
    assert_eq!(read_json(&mut anon).await["payload"]["text"], "hi");
    assert_eq!(read_json(&mut ada).await["payload"]["text"], "hi");
}

#[tokio::test]
async fn closing_a_socket_releases_the_connection() {
    let (addr, server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;
    let _bob = connect(addr, "/ws/2").await;
    assert_eq!(server.connection_count(), 2);

    ada.close(None).await.unwrap();
    timeout(TIMEOUT, async {
        while server.connection_count() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection was not released");
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let (addr, server) = boot(consumer(false)).await;
    let mut ada = connect(addr, "/ws/1").await;

    server.shutdown().shutdown();
    let closed = timeout(TIMEOUT, async {
        loop {
            match ada.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn graceful_shutdown_waits_for_sessions() {
    let departures = Arc::new(AtomicUsize::new(0));
    let consumer = Consumer::builder("test")
        .group("room")
        .event(Ready)
        .lifecycle(Departures(departures.clone()))
        .build();
    let (addr, server, handle) = serve(consumer).await;
    let _ada = connect(addr, "/ws/1").await;
    let _bob = connect(addr, "/ws/2").await;
    assert_eq!(server.connection_count(), 2);

    server.graceful_shutdown(handle, Some(TIMEOUT)).await;
    assert_eq!(departures.load(Ordering::SeqCst), 2);
    assert_eq!(server.connection_count(), 0);
}
