//! Per-connection routing: event handlers, the registry that maps wire
//! names to them, target resolution and the routing pass itself.

pub mod engine;
pub mod handler;
pub mod registry;
pub mod resolver;

pub use engine::{
    run_pass, HookError, Outbox, PassOutcome, PassReport, RoutingMessage, RoutingOptions,
    TargetRules, TargetView,
};
pub use handler::{EventHandler, HookResult, Reply};
pub use registry::{DynEvent, EventDescriptor, EventRegistry, RoutingContext};
pub use resolver::{LookupResolver, ResolverTable};
