//! `CourierServer`: axum HTTP + WebSocket front end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use courier_core::ports::ConnectionInfo;
use courier_core::{ConnectionId, Principal, UserId};
use courier_telemetry::metrics as m;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ClientConnection;
use crate::config::ServerConfig;
use crate::connection::{admit, Admission, Connection, Services};
use crate::consumer::Consumer;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;

/// Client frames buffered between the socket reader and the actor.
const FRAME_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    consumer: Arc<Consumer>,
    services: Arc<Services>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    connections: Arc<AtomicUsize>,
    sessions: TaskTracker,
    prometheus: Option<PrometheusHandle>,
}

pub struct CourierServer {
    state: AppState,
}

impl CourierServer {
    pub fn new(config: ServerConfig, consumer: Consumer, services: Services) -> Self {
        Self {
            state: AppState {
                config: Arc::new(config),
                consumer: Arc::new(consumer),
                services: Arc::new(services),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                connections: Arc::new(AtomicUsize::new(0)),
                sessions: TaskTracker::new(),
                prometheus: None,
            },
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_prometheus(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.state.prometheus = handle;
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/ws/{user_id}", get(ws_user_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/events", get(events_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in the background until shutdown is signalled.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let stopped = async move { token.cancelled().await };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(stopped)
                .await
            {
                error!(error = %err, "server stopped with error");
            }
        });

        info!(%local_addr, consumer = %self.state.consumer.name, "courier listening");
        Ok((local_addr, handle))
    }

    /// Signal shutdown, then wait up to `timeout` for `server` and every
    /// upgraded session to finish.
    pub async fn graceful_shutdown(&self, server: JoinHandle<()>, timeout: Option<Duration>) {
        self.state.sessions.close();
        let sessions = self.state.sessions.clone();
        let drained = tokio::spawn(async move { sessions.wait().await });
        self.state
            .shutdown
            .graceful_shutdown(vec![server, drained], timeout)
            .await;
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.state.consumer
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    upgrade(ws, state, None, query).await
}

/// GET /ws/{user_id}
async fn ws_user_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    upgrade(ws, state, Some(UserId(user_id)), query).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    path_user: Option<UserId>,
    query: HashMap<String, String>,
) -> Response {
    let mut info = ConnectionInfo::new(ConnectionId::new()).with_query(query);
    if let Some(user_id) = path_user {
        info = info.with_path_user(user_id);
    }

    match admit(&state.consumer, &state.services, &info).await {
        Ok(Admission::Accepted(principal)) => {
            let sessions = state.sessions.clone();
            ws.max_message_size(state.config.max_message_size)
                .on_upgrade(move |socket| {
                    sessions.track_future(run_ws_session(socket, info, principal, state))
                })
        }
        Ok(Admission::Refused(reason)) => (StatusCode::FORBIDDEN, reason).into_response(),
        Err(err) => {
            error!(connection_id = %info.connection_id, error = %err, "admission failed");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Drive one accepted socket: writer task (frames out, pings), actor task
/// (the [`Connection`]) and the reader loop inline.
#[instrument(skip_all, fields(connection_id = %info.connection_id))]
async fn run_ws_session(socket: WebSocket, info: ConnectionInfo, principal: Principal, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(state.config.send_queue.max(1));
    let client = Arc::new(ClientConnection::new(info.connection_id.clone(), send_tx));
    let connection = Arc::new(Connection::new(
        &info,
        principal,
        state.consumer.clone(),
        state.services.clone(),
        client.clone(),
    ));

    counter!(m::WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(m::WS_CONNECTIONS_ACTIVE).increment(1.0);
    state.connections.fetch_add(1, Ordering::Relaxed);
    let cancel = state.shutdown.child_token();

    let ping_interval = Duration::from_secs(state.config.heartbeat_interval_secs.max(1));
    let pong_timeout = Duration::from_secs(state.config.pong_timeout_secs);
    let writer = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_interval);
            // first tick is immediate
            let _ = ping.tick().await;
            loop {
                tokio::select! {
                    msg = send_rx.recv() => {
                        let Some(text) = msg else { break };
                        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if !client.check_alive() && client.last_pong_elapsed() > pong_timeout {
                            warn!(?pong_timeout, "client unresponsive, disconnecting");
                            break;
                        }
                        if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    () = cancel.cancelled() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            cancel.cancel();
        })
    };

    let inbox = match connection.start().await {
        Ok(inbox) => inbox,
        Err(err) => {
            error!(error = %err, "connection start failed");
            cancel.cancel();
            let _ = writer.await;
            finish(&state, &client);
            return;
        }
    };

    let (frames_tx, frames_rx) = mpsc::channel::<String>(FRAME_QUEUE);
    let actor = {
        let connection = connection.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { connection.run(frames_rx, inbox, cancel).await })
    };

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = ws_rx.next() => next,
        };
        let Some(Ok(msg)) = next else { break };
        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => text.to_owned(),
                Err(_) => {
                    debug!(len = data.len(), "non-utf8 binary frame ignored");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                client.mark_alive();
                continue;
            }
        };
        if frames_tx.send(text).await.is_err() {
            break;
        }
    }

    // Let the actor drain queued frames, then stop the writer.
    drop(frames_tx);
    if let Err(err) = actor.await {
        error!(error = %err, "connection actor panicked");
    }
    cancel.cancel();
    let _ = writer.await;
    finish(&state, &client);
}

fn finish(state: &AppState, client: &ClientConnection) {
    state.connections.fetch_sub(1, Ordering::Relaxed);
    gauge!(m::WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(age = ?client.age(), dropped = client.drop_count(), "session ended");
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Relaxed),
        &state.consumer.name,
        state.consumer.group.as_deref(),
        state.consumer.registry.names().len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => m::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

/// GET /events
async fn events_handler(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(state.consumer.registry.describe())
}
