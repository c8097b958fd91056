//! The demo `chat` connection type.

use async_trait::async_trait;
use courier_core::{Envelope, EventName, Field, Payload, RawPayload, Shape, TargetClass};
use courier_routing::{EventHandler, HookError, HookResult, Outbox, Reply, RoutingMessage};
use courier_server::settings::ConsumerSettings;
use courier_server::{Consumer, Lifecycle, LifecycleContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
}

impl Payload for Message {
    const SHAPE: Shape = Shape::closed("Message", &[Field::required("text")]);
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectRequest {
    pub text: String,
    /// Numeric id, or a string holding one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_username: Option<String>,
}

impl Payload for DirectRequest {
    const SHAPE: Shape = Shape::closed(
        "DirectRequest",
        &[
            Field::required("text"),
            Field::optional("to_user_id"),
            Field::optional("to_username"),
        ],
    );
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectDelivery {
    pub text: String,
    /// Absent when the sender is anonymous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<i64>,
}

impl Payload for DirectDelivery {
    const SHAPE: Shape = Shape::closed(
        "DirectDelivery",
        &[Field::required("text"), Field::optional("from_user_id")],
    );
}

/// Message to everyone in the room, sender included.
pub struct ChatSend;

#[async_trait]
impl EventHandler for ChatSend {
    const NAME: &'static str = "ChatSend";
    type Request = Message;
    type InitiatorReply = RawPayload;
    type TargetReply = Message;

    async fn target_catch(
        &self,
        msg: &RoutingMessage<Message>,
        _out: &dyn Outbox,
    ) -> HookResult<Message> {
        Ok(Some(Reply::Echo(Message {
            text: msg.payload.text.clone(),
        })))
    }
}

/// Echoed back to the sender only.
pub struct SelfOnly;

#[async_trait]
impl EventHandler for SelfOnly {
    const NAME: &'static str = "SelfOnly";
    const TARGET: TargetClass = TargetClass::ForInitiator;
    type Request = Message;
    type InitiatorReply = RawPayload;
    type TargetReply = Message;

    async fn target_catch(
        &self,
        msg: &RoutingMessage<Message>,
        _out: &dyn Outbox,
    ) -> HookResult<Message> {
        Ok(Some(Reply::Echo(Message {
            text: msg.payload.text.clone(),
        })))
    }
}

/// Message to one user, addressed by `to_user_id` or `to_username`.
pub struct DirectMessage;

#[async_trait]
impl EventHandler for DirectMessage {
    const NAME: &'static str = "DirectMessage";
    const TARGET: TargetClass = TargetClass::ForUser;
    type Request = DirectRequest;
    type InitiatorReply = RawPayload;
    type TargetReply = DirectDelivery;

    async fn before_catch(
        &self,
        msg: &RoutingMessage<DirectRequest>,
        _out: &dyn Outbox,
    ) -> Result<(), HookError> {
        msg.ensure_recipient_not_initiator()
    }

    async fn target_catch(
        &self,
        msg: &RoutingMessage<DirectRequest>,
        out: &dyn Outbox,
    ) -> HookResult<DirectDelivery> {
        let happy = Envelope::from_payload(
            EventName::from_declared(HappyReceiver::NAME),
            &Message {
                text: "You got a direct message".into(),
            },
        )
        .map_err(HookError::fault)?;
        out.broadcast(happy).await?;

        Ok(Some(Reply::Echo(DirectDelivery {
            text: msg.payload.text.clone(),
            from_user_id: msg.meta.initiator_user_id().map(|id| id.0),
        })))
    }
}

/// Hidden; broadcast by the recipient of a direct message and delivered
/// back to that connection only.
pub struct HappyReceiver;

#[async_trait]
impl EventHandler for HappyReceiver {
    const NAME: &'static str = "HappyReceiver";
    const TARGET: TargetClass = TargetClass::ForInitiator;
    const HIDDEN: bool = true;
    type Request = Message;
    type InitiatorReply = RawPayload;
    type TargetReply = Message;

    async fn target_catch(
        &self,
        msg: &RoutingMessage<Message>,
        _out: &dyn Outbox,
    ) -> HookResult<Message> {
        Ok(Some(Reply::Echo(Message {
            text: msg.payload.text.clone(),
        })))
    }
}

/// Logs joins and leaves.
pub struct Presence;

#[async_trait]
impl Lifecycle for Presence {
    async fn after_connect(&self, ctx: &LifecycleContext<'_>) -> Result<(), HookError> {
        info!(connection_id = %ctx.connection_id, user_id = ?ctx.user.user_id(), "joined chat");
        Ok(())
    }

    async fn before_disconnect(&self, ctx: &LifecycleContext<'_>) -> Result<(), HookError> {
        info!(connection_id = %ctx.connection_id, user_id = ?ctx.user.user_id(), "left chat");
        Ok(())
    }
}

pub fn consumer(settings: &ConsumerSettings) -> Consumer {
    Consumer::builder("chat")
        .event(ChatSend)
        .event(SelfOnly)
        .event(DirectMessage)
        .event(HappyReceiver)
        .lifecycle(Presence)
        .settings(settings)
        .build()
}
