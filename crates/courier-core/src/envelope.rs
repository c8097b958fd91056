use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::meta::SystemMeta;
use crate::payload::Payload;

/// Dot-separated hierarchical event name, e.g. `chat.send`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventName(String);

impl EventName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Wire name for a CamelCase declared name (`ChatSend` -> `chat.send`).
    pub fn from_declared(declared: &str) -> Self {
        Self(camel_to_dot(declared))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Split a CamelCase identifier at case boundaries and join the lowercase
/// words with dots. Acronym runs stay together (`HTTPPing` -> `http.ping`).
pub fn camel_to_dot(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 8);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower);
            if boundary && !out.ends_with('.') {
                out.push('.');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// JSON frame exchanged with peers and with the pub/sub layer.
///
/// `system` is only present on group deliveries; it is never sent to a
/// client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemMeta>,
}

/// Wire-level unit: event name, routing metadata, payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub name: EventName,
    pub system: Option<SystemMeta>,
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(name: impl Into<EventName>, payload: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            system: None,
            payload,
        }
    }

    pub fn from_payload<P: Payload>(
        name: impl Into<EventName>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(name, payload.to_map()?))
    }

    /// Build the envelope for a client frame. Any client-supplied `system`
    /// is discarded in favour of the freshly generated one.
    pub fn from_inbound(frame: Frame, system: SystemMeta) -> Self {
        Self {
            name: EventName::new(frame.event),
            system: Some(system),
            payload: frame.payload,
        }
    }

    #[must_use]
    pub fn with_system(mut self, system: SystemMeta) -> Self {
        self.system = Some(system);
        self
    }

    /// Frame for a peer: routing metadata stripped.
    pub fn to_client_frame(&self) -> Frame {
        Frame {
            event: self.name.as_str().to_owned(),
            payload: self.payload.clone(),
            system: None,
        }
    }

    /// Frame for the pub/sub layer: routing metadata retained.
    pub fn to_group_frame(&self) -> Frame {
        Frame {
            event: self.name.as_str().to_owned(),
            payload: self.payload.clone(),
            system: self.system.clone(),
        }
    }

    pub fn to_client_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_client_frame())
    }
}

impl From<Frame> for Envelope {
    fn from(frame: Frame) -> Self {
        Self {
            name: EventName::new(frame.event),
            system: frame.system,
            payload: frame.payload,
        }
    }
}

impl From<String> for EventName {
    fn from(s: String) -> Self {
        Self(s)
    }
}
