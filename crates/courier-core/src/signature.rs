//! Signature validation.
//!
//! Typed payloads are built from untyped mappings in two steps: the mapping
//! is checked against the payload's declared [`Shape`](crate::payload::Shape)
//! and only then handed to serde. Shape mismatches come back as structured
//! outcomes naming the offending field; anything serde rejects after that
//! (wrong value types, bad nested data) is an unclassified fault.

use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::payload::Payload;

/// Outcome of building a typed payload from a mapping.
#[derive(Debug, PartialEq)]
pub enum Construction<P> {
    Built(P),
    /// A required field is absent.
    MissingField(String),
    /// The mapping carries a field the shape does not declare.
    UnexpectedField(String),
}

impl<P> Construction<P> {
    /// Built payload, or the protocol error a shape mismatch reports.
    pub fn into_result(self) -> Result<P, ProtocolError> {
        match self {
            Self::Built(p) => Ok(p),
            Self::MissingField(required) => Err(ProtocolError::PayloadSignatureWrong { required }),
            Self::UnexpectedField(unexpected) => {
                Err(ProtocolError::ActionSignatureWrong { unexpected })
            }
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self, Self::Built(_))
    }
}

/// First shape mismatch of `map` against `P::SHAPE`, if any.
///
/// Unexpected fields win over missing ones. Only one offender is reported:
/// the first unexpected key in mapping order, else the first missing
/// required field in declaration order.
pub fn check_shape<P: Payload>(map: &Map<String, Value>) -> Option<Construction<P>> {
    let shape = P::SHAPE;
    if shape.is_open() {
        return None;
    }
    if let Some(key) = map.keys().find(|k| !shape.accepts(k)) {
        return Some(Construction::UnexpectedField(key.clone()));
    }
    shape
        .fields()
        .iter()
        .find(|f| f.required && !map.contains_key(f.name))
        .map(|f| Construction::MissingField(f.name.to_owned()))
}

/// Build `P` from `map`.
pub fn construct<P: Payload>(map: &Map<String, Value>) -> Result<Construction<P>, serde_json::Error> {
    if let Some(mismatch) = check_shape::<P>(map) {
        return Ok(mismatch);
    }
    serde_json::from_value(Value::Object(map.clone())).map(Construction::Built)
}
