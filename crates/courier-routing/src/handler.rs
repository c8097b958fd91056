use async_trait::async_trait;
use courier_core::{Envelope, EventName, Payload, TargetClass};

use crate::engine::{HookError, Outbox, RoutingMessage};

/// What a role hook sends back to its own connection.
#[derive(Debug)]
pub enum Reply<P> {
    /// A payload sent under the handler's own event name.
    Echo(P),
    /// Any envelope, sent as-is.
    Event(Envelope),
}

impl<P: Payload> Reply<P> {
    pub fn into_envelope(self, name: &EventName) -> Result<Envelope, serde_json::Error> {
        match self {
            Self::Echo(payload) => Envelope::from_payload(name.clone(), &payload),
            Self::Event(envelope) => Ok(envelope),
        }
    }
}

pub type HookResult<P> = Result<Option<Reply<P>>, HookError>;

/// One event kind of a connection type.
///
/// `NAME` is the CamelCase declared name; the wire name is derived from it
/// (`ChatSend` is sent as `chat.send`). Every hook has a no-op default, so a
/// handler only overrides the roles it cares about.
///
/// Hook order within one routing pass:
///
/// 1. `before_catch`, at most once, before the first role that applies
/// 2. `initiator_catch`, if this connection sent the event
/// 3. `target_catch`, if this connection is a target
/// 4. `after_catch`, only when the connection type opts in
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    const NAME: &'static str;
    const TARGET: TargetClass = TargetClass::ForAll;
    /// Hidden events cannot be sent by clients; only the server broadcasts them.
    const HIDDEN: bool = false;

    type Request: Payload;
    type InitiatorReply: Payload;
    type TargetReply: Payload;

    async fn before_catch(
        &self,
        _msg: &RoutingMessage<Self::Request>,
        _out: &dyn Outbox,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn initiator_catch(
        &self,
        _msg: &RoutingMessage<Self::Request>,
        _out: &dyn Outbox,
    ) -> HookResult<Self::InitiatorReply> {
        Ok(None)
    }

    async fn target_catch(
        &self,
        _msg: &RoutingMessage<Self::Request>,
        _out: &dyn Outbox,
    ) -> HookResult<Self::TargetReply> {
        Ok(None)
    }

    async fn after_catch(
        &self,
        _msg: &RoutingMessage<Self::Request>,
        _out: &dyn Outbox,
    ) -> Result<(), HookError> {
        Ok(())
    }
}
