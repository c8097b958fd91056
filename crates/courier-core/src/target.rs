use std::fmt;

use serde_json::{Map, Value};

/// Recipient class of an event kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetClass {
    /// Every connection in the group is a target.
    ForAll,
    /// Only connections of the resolved recipient user.
    ForUser,
    /// Only the connection the event came from.
    ForInitiator,
    /// Decided by a named rule from the connection type's rule table.
    Custom(&'static str),
}

impl TargetClass {
    /// Whether a pass needs a resolved recipient before any hook runs.
    pub fn requires_recipient(&self) -> bool {
        matches!(self, Self::ForUser)
    }

    /// Whether lookup criteria are resolved into a target user.
    pub fn resolves_target(&self) -> bool {
        matches!(self, Self::ForUser | Self::Custom(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForAll => "for_all",
            Self::ForUser => "for_user",
            Self::ForInitiator => "for_initiator",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for TargetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload key a lookup field is read from.
pub fn lookup_key(field: &str) -> String {
    format!("to_{field}")
}

/// Populated `(field, value)` pairs, in lookup-field order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LookupCriteria(Vec<(String, Value)>);

impl LookupCriteria {
    /// Read `to_<field>` for each lookup field. Absent and null keys are
    /// skipped.
    pub fn extract<S: AsRef<str>>(payload: &Map<String, Value>, fields: &[S]) -> Self {
        let pairs = fields
            .iter()
            .filter_map(|field| {
                let field = field.as_ref();
                match payload.get(&lookup_key(field)) {
                    None | Some(Value::Null) => None,
                    Some(value) => Some((field.to_owned(), value.clone())),
                }
            })
            .collect();
        Self(pairs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.iter().find(|(f, _)| f == field).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(f, v)| (f.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for LookupCriteria {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
