//! Connection types: the event kinds a socket speaks, the group it joins
//! and what runs when it opens and closes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{ConnectionId, Principal};
use courier_routing::{
    EventHandler, EventRegistry, HookError, LookupResolver, Outbox, ResolverTable, RoutingOptions,
    TargetRules, TargetView,
};

use crate::settings::ConsumerSettings;

/// Session cache entries live for 40 minutes unless configured otherwise.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(40 * 60);

/// What a lifecycle hook can see.
pub struct LifecycleContext<'a> {
    pub connection_id: &'a ConnectionId,
    pub user: &'a Principal,
    pub outbox: &'a dyn Outbox,
}

/// Hooks around a connection's lifetime.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Runs once the connection is accepted, cached and in its group.
    async fn after_connect(&self, _ctx: &LifecycleContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs before the connection leaves its group.
    async fn before_disconnect(&self, _ctx: &LifecycleContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
}

struct NoLifecycle;

impl Lifecycle for NoLifecycle {}

/// A connection type, shared by every socket of that type.
pub struct Consumer {
    pub name: String,
    /// Group every connection joins. `None` means inbound events are
    /// accepted and logged but never published.
    pub group: Option<String>,
    pub require_auth: bool,
    pub session_ttl: Duration,
    pub registry: EventRegistry,
    pub resolvers: ResolverTable,
    pub rules: TargetRules,
    pub options: RoutingOptions,
    pub lifecycle: Arc<dyn Lifecycle>,
}

impl Consumer {
    pub fn builder(name: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder {
            consumer: Self {
                name: name.into(),
                group: None,
                require_auth: false,
                session_ttl: DEFAULT_SESSION_TTL,
                registry: EventRegistry::new(),
                resolvers: ResolverTable::default(),
                rules: TargetRules::new(),
                options: RoutingOptions::default(),
                lifecycle: Arc::new(NoLifecycle),
            },
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("require_auth", &self.require_auth)
            .field("session_ttl", &self.session_ttl)
            .field("events", &self.registry.names())
            .field("resolvers", &self.resolvers)
            .field("rules", &self.rules)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[must_use]
pub struct ConsumerBuilder {
    consumer: Consumer,
}

impl ConsumerBuilder {
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.consumer.group = Some(group.into());
        self
    }

    pub fn require_auth(mut self, require: bool) -> Self {
        self.consumer.require_auth = require;
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.consumer.session_ttl = ttl;
        self
    }

    pub fn event<H: EventHandler>(mut self, handler: H) -> Self {
        self.consumer.registry.register(handler);
        self
    }

    /// Add or replace the resolver behind `to_<field>`.
    pub fn resolver(mut self, field: &str, resolver: Arc<dyn LookupResolver>) -> Self {
        self.consumer.resolvers = self.consumer.resolvers.with_resolver(field, resolver);
        self
    }

    /// Keep only these lookup fields, in this order.
    pub fn lookup_fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.consumer.resolvers = self.consumer.resolvers.restricted_to(fields);
        self
    }

    pub fn rule(
        mut self,
        name: &'static str,
        rule: impl Fn(&TargetView<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.consumer.rules = self.consumer.rules.with_rule(name, rule);
        self
    }

    pub fn run_after_catch(mut self, enabled: bool) -> Self {
        self.consumer.options.run_after_catch = enabled;
        self
    }

    pub fn lifecycle(mut self, lifecycle: impl Lifecycle + 'static) -> Self {
        self.consumer.lifecycle = Arc::new(lifecycle);
        self
    }

    /// Apply the `[consumer]` settings section.
    pub fn settings(self, settings: &ConsumerSettings) -> Self {
        let mut builder = self
            .require_auth(settings.require_auth)
            .session_ttl(settings.session_ttl())
            .lookup_fields(settings.lookup_fields.as_slice())
            .run_after_catch(settings.run_after_catch);
        builder.consumer.group = settings.group.clone();
        builder
    }

    pub fn build(self) -> Consumer {
        self.consumer
    }
}
