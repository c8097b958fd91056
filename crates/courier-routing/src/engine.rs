//! The routing pass.
//!
//! Every connection in a group receives every published envelope and
//! evaluates it on its own: is this connection the sender, a recipient, both
//! or neither. One evaluation is a *pass*; it owns its [`RoutingMessage`]
//! and its before gate, and nothing from it outlives the call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use courier_core::{
    Envelope, EventName, LookupCriteria, MessageMeta, Principal, ProcessingError, ProtocolError,
    TargetClass, User,
};
use courier_telemetry::metrics as m;
use tracing::{debug, trace};

use crate::handler::EventHandler;

/// Failure returned by a hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Reported to this connection as an error envelope; the pass ends.
    #[error(transparent)]
    Rejected(#[from] ProtocolError),
    /// Unclassified; surfaces as a processing fault.
    #[error("{0}")]
    Fault(String),
}

impl HookError {
    pub fn fault(err: impl fmt::Display) -> Self {
        Self::Fault(err.to_string())
    }
}

impl From<ProcessingError> for HookError {
    fn from(err: ProcessingError) -> Self {
        Self::Fault(err.to_string())
    }
}

/// Outbound side of the connection a pass runs on.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Queue an envelope for this connection's peer.
    async fn send(&self, envelope: Envelope) -> Result<(), ProcessingError>;

    /// Publish a new event to the group, originating from this connection.
    /// Hidden events may be broadcast this way.
    async fn broadcast(&self, envelope: Envelope) -> Result<usize, ProcessingError>;
}

/// What a target rule gets to look at.
#[derive(Debug)]
pub struct TargetView<'a> {
    pub user: &'a Principal,
    pub target_user: Option<&'a User>,
    pub meta: &'a MessageMeta,
    pub lookup: &'a LookupCriteria,
    pub is_initiator: bool,
}

type TargetRule = Arc<dyn Fn(&TargetView<'_>) -> bool + Send + Sync>;

/// Named predicates backing [`TargetClass::Custom`].
#[derive(Clone, Default)]
pub struct TargetRules {
    rules: HashMap<&'static str, TargetRule>,
}

impl TargetRules {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_rule(
        mut self,
        name: &'static str,
        rule: impl Fn(&TargetView<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rules.insert(name, Arc::new(rule));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Unknown rules match nothing.
    pub fn evaluate(&self, name: &str, view: &TargetView<'_>) -> bool {
        self.rules.get(name).is_some_and(|rule| rule(view))
    }
}

impl fmt::Debug for TargetRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.rules.keys().collect();
        names.sort();
        f.debug_struct("TargetRules").field("rules", &names).finish()
    }
}

/// Per-connection-type switches for the pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingOptions {
    /// Call `after_catch` once at the end of a pass in which a role ran.
    pub run_after_catch: bool,
}

/// One message as seen by one connection.
#[derive(Debug)]
pub struct RoutingMessage<P> {
    pub payload: P,
    pub meta: MessageMeta,
    /// The user of the connection running the pass.
    pub user: Principal,
    pub target: TargetClass,
    pub lookup: LookupCriteria,
    pub target_user: Option<User>,
}

impl<P> RoutingMessage<P> {
    /// Whether this connection's user sent the event. Falls back to the
    /// connection ids when either side is anonymous.
    pub fn is_initiator(&self) -> bool {
        match (self.user.user_id(), self.meta.initiator_user_id()) {
            (Some(me), Some(initiator)) => me == initiator,
            _ => self.meta.is_loopback(),
        }
    }

    pub fn is_target(&self, rules: &TargetRules) -> bool {
        match self.target {
            TargetClass::ForAll => true,
            TargetClass::ForUser => match (&self.target_user, self.user.user_id()) {
                (Some(target), Some(me)) => target.id == me,
                _ => false,
            },
            TargetClass::ForInitiator => self.is_initiator(),
            TargetClass::Custom(name) => rules.evaluate(name, &self.view()),
        }
    }

    pub fn view(&self) -> TargetView<'_> {
        TargetView {
            user: &self.user,
            target_user: self.target_user.as_ref(),
            meta: &self.meta,
            lookup: &self.lookup,
            is_initiator: self.is_initiator(),
        }
    }

    /// Refuse messages whose resolved recipient is the sender.
    pub fn ensure_recipient_not_initiator(&self) -> Result<(), HookError> {
        match (&self.target_user, self.meta.initiator_user_id()) {
            (Some(target), Some(initiator)) if target.id == initiator => {
                Err(ProtocolError::RecipientIsMe.into())
            }
            _ => Ok(()),
        }
    }
}

/// Which hooks ran during a completed pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub before_ran: bool,
    pub initiator_ran: bool,
    pub target_ran: bool,
    pub after_ran: bool,
    pub replies: usize,
}

impl PassReport {
    pub fn any_role(&self) -> bool {
        self.initiator_ran || self.target_ran
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// The pass stopped; the error goes to this connection only.
    Rejected(ProtocolError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BeforeGate {
    Pending,
    Activated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Initiator,
    Target,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Target => "target",
        }
    }
}

/// Run one routing pass of `handler` over `msg`.
///
/// Replies are written to `out` as each role hook returns them. A hook that
/// rejects ends the pass with [`PassOutcome::Rejected`]; hook faults and
/// reply encoding failures come back as `Err`.
pub async fn run_pass<H: EventHandler>(
    handler: &H,
    msg: &RoutingMessage<H::Request>,
    rules: &TargetRules,
    options: RoutingOptions,
    out: &dyn Outbox,
) -> Result<PassOutcome, ProcessingError> {
    let name = EventName::from_declared(H::NAME);
    let started = Instant::now();
    let outcome = evaluate(handler, &name, msg, rules, options, out).await;
    metrics::counter!(m::ROUTING_PASSES_TOTAL, "event" => name.to_string()).increment(1);
    metrics::histogram!(m::ROUTING_PASS_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(report) => {
            trace!(event = %name, ?report, "routing pass completed");
            Ok(PassOutcome::Completed(report))
        }
        Err(HookError::Rejected(err)) => {
            debug!(event = %name, kind = err.kind(), "routing pass rejected");
            Ok(PassOutcome::Rejected(err))
        }
        Err(HookError::Fault(message)) => Err(ProcessingError::Hook {
            event: name.to_string(),
            message,
        }),
    }
}

async fn evaluate<H: EventHandler>(
    handler: &H,
    name: &EventName,
    msg: &RoutingMessage<H::Request>,
    rules: &TargetRules,
    options: RoutingOptions,
    out: &dyn Outbox,
) -> Result<PassReport, HookError> {
    let is_initiator = msg.is_initiator();

    if msg.target.requires_recipient() && msg.target_user.is_none() && is_initiator {
        return Err(ProtocolError::RecipientNotExist.into());
    }

    let mut roles = Vec::with_capacity(2);
    if is_initiator {
        roles.push(Role::Initiator);
    }
    if msg.is_target(rules) {
        roles.push(Role::Target);
    }

    let mut report = PassReport::default();
    let mut gate = BeforeGate::Pending;

    for role in roles {
        if gate == BeforeGate::Pending {
            handler.before_catch(msg, out).await?;
            gate = BeforeGate::Activated;
            report.before_ran = true;
        }

        trace!(event = %name, role = role.as_str(), "running role hook");
        let reply = match role {
            Role::Initiator => {
                report.initiator_ran = true;
                handler
                    .initiator_catch(msg, out)
                    .await?
                    .map(|r| r.into_envelope(name))
            }
            Role::Target => {
                report.target_ran = true;
                handler
                    .target_catch(msg, out)
                    .await?
                    .map(|r| r.into_envelope(name))
            }
        };

        if let Some(envelope) = reply {
            let envelope = envelope.map_err(HookError::fault)?;
            out.send(envelope).await?;
            report.replies += 1;
        }
    }

    if options.run_after_catch && report.any_role() {
        handler.after_catch(msg, out).await?;
        report.after_ran = true;
    }

    Ok(report)
}
