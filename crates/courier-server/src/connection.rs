//! The connection coordinator.
//!
//! A [`Connection`] is an actor: one task owns it and feeds it client frames
//! and group deliveries one at a time. Inbound frames are validated and
//! published to the group; every delivery (including the connection's own
//! publishes coming back) runs a routing pass locally.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::ports::{
    AuthGate, ChannelLayer, ConnectionInfo, Directory, PublishError, SessionCache,
};
use courier_core::{
    ConnectionId, Envelope, Frame, MessageMeta, Principal, ProcessingError, ProtocolError,
    SystemMeta, User,
};
use courier_routing::{HookError, Outbox, PassOutcome, RoutingContext};
use courier_telemetry::metrics as m;
use metrics::counter;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::client::ClientConnection;
use crate::consumer::{Consumer, LifecycleContext};
use crate::memory::{AllowAll, LocalChannelLayer, MemoryCache, StaticDirectory};

const INVALID_FRAME: &str = "Invalid frame";
const INVALID_PAYLOAD: &str = "Invalid payload";

/// External collaborators shared by every connection.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthGate>,
    pub directory: Arc<dyn Directory>,
    pub cache: Arc<dyn SessionCache>,
    /// `None` disables publishing; grouped connection types then answer
    /// every event with `error.channel_layer_disabled`.
    pub channels: Option<Arc<dyn ChannelLayer>>,
}

impl Services {
    /// All collaborators in process, seeded with a fixed user table.
    pub fn in_memory(users: Vec<User>) -> Self {
        Self {
            auth: Arc::new(AllowAll),
            directory: Arc::new(StaticDirectory::new(users)),
            cache: Arc::new(MemoryCache::new()),
            channels: Some(Arc::new(LocalChannelLayer::new())),
        }
    }
}

/// Result of the pre-upgrade checks.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted(Principal),
    Refused(&'static str),
}

/// Consult the auth gate and resolve the connecting user.
pub async fn admit(
    consumer: &Consumer,
    services: &Services,
    info: &ConnectionInfo,
) -> Result<Admission, ProcessingError> {
    if !services.auth.authorize(info).await {
        return Ok(refuse(info, "unauthorized"));
    }
    let principal = services.directory.current_user(info).await?;
    if consumer.require_auth && principal.is_anonymous() {
        return Ok(refuse(info, "anonymous"));
    }
    Ok(Admission::Accepted(principal))
}

fn refuse(info: &ConnectionInfo, reason: &'static str) -> Admission {
    counter!(m::WS_CONNECTIONS_REFUSED_TOTAL, "reason" => reason).increment(1);
    info!(connection_id = %info.connection_id, reason, "connection refused");
    Admission::Refused(reason)
}

pub struct Connection {
    id: ConnectionId,
    principal: Principal,
    connected_at: DateTime<Utc>,
    consumer: Arc<Consumer>,
    services: Arc<Services>,
    client: Arc<ClientConnection>,
}

impl Connection {
    pub fn new(
        info: &ConnectionInfo,
        principal: Principal,
        consumer: Arc<Consumer>,
        services: Arc<Services>,
        client: Arc<ClientConnection>,
    ) -> Self {
        Self {
            id: info.connection_id.clone(),
            principal,
            connected_at: info.connected_at,
            consumer,
            services,
            client,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Cache the session, join the group and run `after_connect`.
    ///
    /// Returns the group inbox, or `None` when the connection type has no
    /// group or no channel layer is configured. A failed session write is
    /// logged and skipped. If `after_connect` faults, the group is left again
    /// before the error is returned and `before_disconnect` never runs.
    #[instrument(skip_all, fields(connection_id = %self.id, consumer = %self.consumer.name))]
    pub async fn start(&self) -> Result<Option<mpsc::UnboundedReceiver<Envelope>>, ProcessingError> {
        if let Some(user) = self.principal.user() {
            self.cache_session(user).await;
        }

        let inbox = match (self.consumer.group.as_deref(), self.channels()) {
            (Some(group), Some(channels)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                channels.join(group, &self.id, tx).await?;
                Some(rx)
            }
            (Some(group), None) => {
                warn!(group, "channel layer disabled, group not joined");
                None
            }
            (None, _) => None,
        };

        let outcome = self
            .consumer
            .lifecycle
            .after_connect(&self.lifecycle_context())
            .await;
        if let Err(err) = self.lifecycle_outcome("after_connect", outcome) {
            self.leave().await;
            return Err(err);
        }

        info!(user_id = ?self.principal.user_id(), "connection started");
        Ok(inbox)
    }

    async fn cache_session(&self, user: &User) {
        let snapshot = json!({
            "connection_id": self.id.as_str(),
            "user_id": user.id,
            "username": user.username,
            "connected_at": self.connected_at.to_rfc3339(),
        });
        let key = session_key(user);
        if let Err(err) = self
            .services
            .cache
            .set(&key, snapshot, self.consumer.session_ttl)
            .await
        {
            counter!(m::SESSION_CACHE_ERRORS_TOTAL).increment(1);
            warn!(key, error = %err, "session snapshot not cached");
        }
    }

    /// Validate one client frame and publish it to the group.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn handle_frame(&self, text: &str) -> Result<(), ProcessingError> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "malformed frame");
                return self.reject(&ProtocolError::custom(INVALID_FRAME));
            }
        };

        let Some(event) = self.consumer.registry.lookup_visible(&frame.event) else {
            debug!(event = %frame.event, "unknown event");
            return self.reject(&ProtocolError::ActionNotExist);
        };
        match event.check_request(&frame.payload) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return self.reject(&err),
            Err(err) => {
                debug!(event = %frame.event, error = %err, "payload rejected by decoder");
                return self.reject(&ProtocolError::custom(INVALID_PAYLOAD));
            }
        }
        counter!(m::EVENTS_RECEIVED_TOTAL, "event" => frame.event.clone()).increment(1);

        let Some(group) = self.consumer.group.as_deref() else {
            info!(event = %frame.event, "no group, event accepted without publishing");
            return Ok(());
        };
        let Some(channels) = self.channels() else {
            return self.reject(&ProtocolError::ChannelLayerDisabled);
        };

        let system = SystemMeta::originate(&self.id, &self.principal);
        let envelope = Envelope::from_inbound(frame, system);
        self.publish(group, channels, envelope).await?;
        Ok(())
    }

    /// Run a routing pass over one group delivery.
    #[instrument(skip_all, fields(connection_id = %self.id, event = %envelope.name))]
    pub async fn handle_delivery(&self, envelope: Envelope) -> Result<(), ProcessingError> {
        let Some(system) = envelope.system else {
            warn!("delivery without system metadata dropped");
            return Ok(());
        };
        let Some(event) = self.consumer.registry.lookup_any(envelope.name.as_str()) else {
            debug!("no handler for delivery");
            return Ok(());
        };

        let meta = MessageMeta::new(system, self.id.clone());
        trace!(event_id = %meta.event_id(), "routing delivery");
        let ctx = RoutingContext {
            user: &self.principal,
            resolvers: &self.consumer.resolvers,
            directory: self.services.directory.as_ref(),
            rules: &self.consumer.rules,
            options: self.consumer.options,
            outbox: self,
        };

        match event.evaluate(&envelope.payload, meta, &ctx).await? {
            PassOutcome::Completed(report) => {
                trace!(?report, "delivery handled");
                Ok(())
            }
            PassOutcome::Rejected(err) => self.reject(&err),
        }
    }

    /// Actor loop: one frame or delivery at a time until the socket closes
    /// or `cancel` fires, then disconnect.
    pub async fn run(
        &self,
        mut frames: mpsc::Receiver<String>,
        mut inbox: Option<mpsc::UnboundedReceiver<Envelope>>,
        cancel: CancellationToken,
    ) {
        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(text) => self.handle_frame(&text).await,
                    None => break,
                },
                Some(envelope) = next_delivery(&mut inbox) => self.handle_delivery(envelope).await,
            };
            if let Err(err) = result {
                self.report(&err);
            }
        }
        self.disconnect().await;
    }

    /// Run `before_disconnect` and leave the group. Failures are logged.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn disconnect(&self) {
        let outcome = self
            .consumer
            .lifecycle
            .before_disconnect(&self.lifecycle_context())
            .await;
        if let Err(err) = self.lifecycle_outcome("before_disconnect", outcome) {
            self.report(&err);
        }

        self.leave().await;
        info!(dropped = self.client.drop_count(), "connection closed");
    }

    async fn leave(&self) {
        if let (Some(group), Some(channels)) = (self.consumer.group.as_deref(), self.channels()) {
            if let Err(err) = channels.leave(group, &self.id).await {
                warn!(group, error = %err, "failed to leave group");
            }
        }
    }

    /// Signature check for server-initiated events, hidden kinds included.
    fn check_broadcast(&self, envelope: &Envelope) -> Result<(), ProcessingError> {
        let event = envelope.name.to_string();
        let Some(kind) = self.consumer.registry.lookup_any(&event) else {
            return Err(ProcessingError::Broadcast {
                event,
                source: ProtocolError::ActionNotExist,
            });
        };
        match kind.check_request(&envelope.payload) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ProcessingError::Broadcast { event, source }),
            Err(source) => Err(ProcessingError::Decode { event, source }),
        }
    }

    fn channels(&self) -> Option<&dyn ChannelLayer> {
        self.services.channels.as_deref()
    }

    async fn publish(
        &self,
        group: &str,
        channels: &dyn ChannelLayer,
        envelope: Envelope,
    ) -> Result<usize, PublishError> {
        let event = envelope.name.to_string();
        let delivered = channels.publish(group, envelope).await?;
        debug!(group, event, delivered, "published");
        counter!(m::EVENTS_PUBLISHED_TOTAL, "event" => event).increment(1);
        Ok(delivered)
    }

    /// Send a classified error to this connection only.
    fn reject(&self, err: &ProtocolError) -> Result<(), ProcessingError> {
        counter!(m::PROTOCOL_ERRORS_TOTAL, "kind" => err.kind()).increment(1);
        debug!(connection_id = %self.id, kind = err.kind(), "protocol error");
        self.client.send_envelope(&err.to_envelope())?;
        Ok(())
    }

    fn report(&self, err: &ProcessingError) {
        counter!(m::PROCESSING_ERRORS_TOTAL).increment(1);
        error!(connection_id = %self.id, error = %err, "processing failed");
    }

    fn lifecycle_context(&self) -> LifecycleContext<'_> {
        LifecycleContext {
            connection_id: &self.id,
            user: &self.principal,
            outbox: self,
        }
    }

    fn lifecycle_outcome(
        &self,
        stage: &str,
        outcome: Result<(), HookError>,
    ) -> Result<(), ProcessingError> {
        match outcome {
            Ok(()) => Ok(()),
            Err(HookError::Rejected(err)) => self.reject(&err),
            Err(HookError::Fault(message)) => Err(ProcessingError::Hook {
                event: stage.to_owned(),
                message,
            }),
        }
    }
}

#[async_trait]
impl Outbox for Connection {
    async fn send(&self, envelope: Envelope) -> Result<(), ProcessingError> {
        self.client.send_envelope(&envelope)?;
        Ok(())
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<usize, ProcessingError> {
        let (Some(group), Some(channels)) = (self.consumer.group.as_deref(), self.channels())
        else {
            return Err(PublishError::Unavailable(format!(
                "connection {} has no group to broadcast {}",
                self.id, envelope.name
            ))
            .into());
        };
        self.check_broadcast(&envelope)?;
        let envelope = envelope.with_system(SystemMeta::originate(&self.id, &self.principal));
        Ok(self.publish(group, channels, envelope).await?)
    }
}

fn session_key(user: &User) -> String {
    format!("session:{}", user.id)
}

async fn next_delivery(inbox: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
