//! Payload shapes.
//!
//! Every event kind declares the shape of the mapping it accepts and of the
//! mappings it sends back. A [`Shape`] is the schema the signature validator
//! checks against before serde ever sees the data, so missing and unexpected
//! fields are reported by name instead of being fished out of error text.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// One declared payload field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub required: bool,
}

impl Field {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    /// Optional fields must carry `#[serde(default)]` on the payload struct.
    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// Ordered field list of a payload type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shape {
    pub name: &'static str,
    fields: &'static [Field],
    open: bool,
}

impl Shape {
    /// A shape that accepts exactly the listed fields.
    pub const fn closed(name: &'static str, fields: &'static [Field]) -> Self {
        Self {
            name,
            fields,
            open: false,
        }
    }

    /// A shape that accepts any mapping.
    pub const fn open(name: &'static str) -> Self {
        Self {
            name,
            fields: &[],
            open: true,
        }
    }

    pub fn fields(&self) -> &'static [Field] {
        self.fields
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn field(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.open || self.field(name).is_some()
    }

    /// Client-facing description, used by the registry listing.
    pub fn describe(&self) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|f| serde_json::json!({ "name": f.name, "required": f.required }))
            .collect();
        serde_json::json!({
            "name": self.name,
            "open": self.open,
            "fields": fields,
        })
    }
}

/// A typed payload with a declared shape.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const SHAPE: Shape;

    /// Serialize into the plain mapping carried by an envelope.
    fn to_map(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                "payload {} serialized to a non-object: {other}",
                Self::SHAPE.name
            ))),
        }
    }
}

/// Untyped payload for events that accept any mapping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RawPayload(pub Map<String, Value>);

impl RawPayload {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl From<Map<String, Value>> for RawPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Payload for RawPayload {
    const SHAPE: Shape = Shape::open("RawPayload");
}
