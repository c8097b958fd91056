//! Envelope model, payload shapes, signature validation and the
//! collaborator ports shared by every Courier crate.

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod meta;
pub mod payload;
pub mod ports;
pub mod signature;
pub mod target;
pub mod user;

pub use envelope::{camel_to_dot, Envelope, EventName, Frame};
pub use errors::{ProcessingError, ProtocolError};
pub use ids::{ConnectionId, EventId};
pub use meta::{MessageMeta, SystemMeta};
pub use payload::{Field, Payload, RawPayload, Shape};
pub use signature::{construct, Construction};
pub use target::{LookupCriteria, TargetClass};
pub use user::{Principal, User, UserId};
