use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::ports::Directory;
use courier_core::{
    construct, EventName, MessageMeta, Payload, Principal, ProcessingError, ProtocolError, Shape,
    TargetClass,
};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::engine::{run_pass, Outbox, PassOutcome, RoutingMessage, RoutingOptions, TargetRules};
use crate::handler::EventHandler;
use crate::resolver::ResolverTable;

/// Static facts about a registered event kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDescriptor {
    pub name: EventName,
    pub target: TargetClass,
    pub hidden: bool,
    pub request: Shape,
    pub initiator_reply: Shape,
    pub target_reply: Shape,
}

impl EventDescriptor {
    fn of<H: EventHandler>() -> Self {
        Self {
            name: EventName::from_declared(H::NAME),
            target: H::TARGET,
            hidden: H::HIDDEN,
            request: <H::Request as Payload>::SHAPE,
            initiator_reply: <H::InitiatorReply as Payload>::SHAPE,
            target_reply: <H::TargetReply as Payload>::SHAPE,
        }
    }

    pub fn describe(&self) -> Value {
        json!({
            "event": self.name.as_str(),
            "target": self.target.as_str(),
            "request": self.request.describe(),
            "initiator_reply": self.initiator_reply.describe(),
            "target_reply": self.target_reply.describe(),
        })
    }
}

/// Everything a pass needs from the connection it runs on.
pub struct RoutingContext<'a> {
    pub user: &'a Principal,
    pub resolvers: &'a ResolverTable,
    pub directory: &'a dyn Directory,
    pub rules: &'a TargetRules,
    pub options: RoutingOptions,
    pub outbox: &'a dyn Outbox,
}

/// Type-erased event kind.
#[async_trait]
pub trait DynEvent: Send + Sync {
    fn descriptor(&self) -> &EventDescriptor;

    /// Signature check of an inbound request payload. `Ok(Err(_))` is a
    /// classified mismatch; `Err(_)` is a payload serde rejected.
    fn check_request(
        &self,
        payload: &Map<String, Value>,
    ) -> Result<Result<(), ProtocolError>, serde_json::Error>;

    /// Decode a group delivery, resolve its target and run the pass.
    async fn evaluate(
        &self,
        payload: &Map<String, Value>,
        meta: MessageMeta,
        ctx: &RoutingContext<'_>,
    ) -> Result<PassOutcome, ProcessingError>;
}

struct Typed<H: EventHandler> {
    handler: H,
    descriptor: EventDescriptor,
}

#[async_trait]
impl<H: EventHandler> DynEvent for Typed<H> {
    fn descriptor(&self) -> &EventDescriptor {
        &self.descriptor
    }

    fn check_request(
        &self,
        payload: &Map<String, Value>,
    ) -> Result<Result<(), ProtocolError>, serde_json::Error> {
        Ok(construct::<H::Request>(payload)?.into_result().map(|_| ()))
    }

    async fn evaluate(
        &self,
        payload: &Map<String, Value>,
        meta: MessageMeta,
        ctx: &RoutingContext<'_>,
    ) -> Result<PassOutcome, ProcessingError> {
        let built = construct::<H::Request>(payload).map_err(|source| ProcessingError::Decode {
            event: self.descriptor.name.to_string(),
            source,
        })?;
        let request = match built.into_result() {
            Ok(request) => request,
            Err(err) => return Ok(PassOutcome::Rejected(err)),
        };

        let lookup = ctx.resolvers.criteria(payload);
        let target_user = if H::TARGET.resolves_target() && !lookup.is_empty() {
            ctx.resolvers.resolve(&lookup, ctx.directory).await?
        } else {
            None
        };

        let msg = RoutingMessage {
            payload: request,
            meta,
            user: ctx.user.clone(),
            target: H::TARGET,
            lookup,
            target_user,
        };
        run_pass(&self.handler, &msg, ctx.rules, ctx.options, ctx.outbox).await
    }
}

/// Wire name -> event kind. Built once per connection type and shared by
/// all its connections.
#[derive(Clone, Default)]
pub struct EventRegistry {
    events: HashMap<EventName, Arc<dyn DynEvent>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the wire name derived from `H::NAME`.
    pub fn register<H: EventHandler>(&mut self, handler: H) {
        let descriptor = EventDescriptor::of::<H>();
        let name = descriptor.name.clone();
        let entry = Typed {
            handler,
            descriptor,
        };
        if self.events.insert(name.clone(), Arc::new(entry)).is_some() {
            warn!(event = %name, "event registered twice, keeping the later handler");
        }
    }

    #[must_use]
    pub fn with<H: EventHandler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    /// Event kinds a client may send. Hidden kinds are not found here.
    pub fn lookup_visible(&self, name: &str) -> Option<Arc<dyn DynEvent>> {
        self.lookup_any(name)
            .filter(|event| !event.descriptor().hidden)
    }

    /// Any event kind, hidden ones included.
    pub fn lookup_any(&self, name: &str) -> Option<Arc<dyn DynEvent>> {
        self.events.get(&EventName::new(name)).map(Arc::clone)
    }

    /// Visible wire names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .events
            .values()
            .filter(|e| !e.descriptor().hidden)
            .map(|e| e.descriptor().name.to_string())
            .collect();
        names.sort();
        names
    }

    /// Descriptions of the visible event kinds, sorted by name.
    pub fn describe(&self) -> Vec<Value> {
        let mut descriptors: Vec<&EventDescriptor> = self
            .events
            .values()
            .map(|e| e.descriptor())
            .filter(|d| !d.hidden)
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors.iter().map(|d| d.describe()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{HookError, PassReport};
    use crate::handler::{HookResult, Reply};
    use courier_core::ports::{ConnectionInfo, DirectoryError};
    use courier_core::{ConnectionId, Envelope, Field, RawPayload, SystemMeta, User, UserId};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Note {
        text: String,
        #[serde(default)]
        to_user_id: Option<i64>,
    }

    impl Payload for Note {
        const SHAPE: Shape = Shape::closed(
            "Note",
            &[Field::required("text"), Field::optional("to_user_id")],
        );
    }

    struct SendNote;

    #[async_trait]
    impl EventHandler for SendNote {
        const NAME: &'static str = "SendNote";
        const TARGET: TargetClass = TargetClass::ForUser;
        type Request = Note;
        type InitiatorReply = RawPayload;
        type TargetReply = Note;

        async fn target_catch(
            &self,
            msg: &RoutingMessage<Note>,
            _out: &dyn Outbox,
        ) -> HookResult<Note> {
            Ok(Some(Reply::Echo(Note {
                text: msg.payload.text.clone(),
                to_user_id: None,
            })))
        }
    }

    struct Secret;

    #[async_trait]
    impl EventHandler for Secret {
        const NAME: &'static str = "SecretPing";
        const HIDDEN: bool = true;
        type Request = RawPayload;
        type InitiatorReply = RawPayload;
        type TargetReply = RawPayload;
    }

    struct OneUser;

    #[async_trait]
    impl Directory for OneUser {
        async fn lookup_user(&self, id: &UserId) -> Result<Option<User>, DirectoryError> {
            Ok((id.0 == 2).then(|| User::new(2, "bob")))
        }

        async fn lookup_username(&self, username: &str) -> Result<Option<User>, DirectoryError> {
            Ok((username == "bob").then(|| User::new(2, "bob")))
        }

        async fn current_user(&self, _info: &ConnectionInfo) -> Result<Principal, DirectoryError> {
            Ok(Principal::Anonymous)
        }
    }

    #[derive(Default)]
    struct Sink(Mutex<Vec<Envelope>>);

    #[async_trait]
    impl Outbox for Sink {
        async fn send(&self, envelope: Envelope) -> Result<(), ProcessingError> {
            self.0.lock().push(envelope);
            Ok(())
        }

        async fn broadcast(&self, _envelope: Envelope) -> Result<usize, ProcessingError> {
            Err(ProcessingError::Hook {
                event: "test".into(),
                message: "no group".into(),
            })
        }
    }

    fn registry() -> EventRegistry {
        EventRegistry::new().with(SendNote).with(Secret)
    }

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn wire_names_derive_from_declared_names() {
        let reg = registry();
        assert_eq!(reg.len(), 2);
        assert!(reg.lookup_visible("send.note").is_some());
        assert!(reg.lookup_visible("SendNote").is_none());
    }

    #[test]
    fn hidden_events_are_only_found_by_lookup_any() {
        let reg = registry();
        assert!(reg.lookup_visible("secret.ping").is_none());
        let hidden = reg.lookup_any("secret.ping").unwrap();
        assert!(hidden.descriptor().hidden);
        assert_eq!(reg.names(), vec!["send.note"]);
    }

    #[test]
    fn describe_lists_visible_shapes() {
        let described = registry().describe();
        assert_eq!(described.len(), 1);
        assert_eq!(described[0]["event"], "send.note");
        assert_eq!(described[0]["target"], "for_user");
        assert_eq!(described[0]["request"]["fields"][0]["name"], "text");
    }

    #[test]
    fn check_request_classifies_mismatches() {
        let event = registry().lookup_visible("send.note").unwrap();
        assert_eq!(event.check_request(&map(json!({"text": "a"}))).unwrap(), Ok(()));
        assert_eq!(
            event.check_request(&map(json!({}))).unwrap(),
            Err(ProtocolError::PayloadSignatureWrong {
                required: "text".into()
            })
        );
        assert_eq!(
            event.check_request(&map(json!({"text": "a", "x": 1}))).unwrap(),
            Err(ProtocolError::ActionSignatureWrong {
                unexpected: "x".into()
            })
        );
        assert!(event.check_request(&map(json!({"text": 1}))).is_err());
    }

    #[tokio::test]
    async fn evaluate_resolves_target_and_replies() {
        let event = registry().lookup_visible("send.note").unwrap();
        let sender = Principal::from(User::new(1, "ada"));
        let receiver = Principal::from(User::new(2, "bob"));
        let sink = Sink::default();
        let ctx = RoutingContext {
            user: &receiver,
            resolvers: &ResolverTable::default(),
            directory: &OneUser,
            rules: &TargetRules::new(),
            options: RoutingOptions::default(),
            outbox: &sink,
        };
        let meta = MessageMeta::new(
            SystemMeta::originate(&ConnectionId::new(), &sender),
            ConnectionId::new(),
        );

        let outcome = event
            .evaluate(&map(json!({"text": "hey", "to_user_id": 2})), meta, &ctx)
            .await
            .unwrap();
        assert!(matches!(outcome, PassOutcome::Completed(PassReport { target_ran: true, .. })));
        let sent = sink.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name.as_str(), "send.note");
        assert_eq!(sent[0].payload["text"], "hey");
    }

    #[tokio::test]
    async fn evaluate_unknown_recipient_rejects_sender() {
        let event = registry().lookup_visible("send.note").unwrap();
        let sender = Principal::from(User::new(1, "ada"));
        let sink = Sink::default();
        let conn = ConnectionId::new();
        let ctx = RoutingContext {
            user: &sender,
            resolvers: &ResolverTable::default(),
            directory: &OneUser,
            rules: &TargetRules::new(),
            options: RoutingOptions::default(),
            outbox: &sink,
        };
        let meta = MessageMeta::new(SystemMeta::originate(&conn, &sender), conn.clone());

        let outcome = event
            .evaluate(&map(json!({"text": "hey", "to_user_id": 42})), meta, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, PassOutcome::Rejected(ProtocolError::RecipientNotExist));
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn duplicate_registration_keeps_one_entry() {
        let mut reg = registry();
        reg.register(SendNote);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn hook_error_from_protocol_error() {
        let err: HookError = ProtocolError::RecipientIsMe.into();
        assert!(matches!(err, HookError::Rejected(ProtocolError::RecipientIsMe)));
    }
}
