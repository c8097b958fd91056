use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable directory identity of a user.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user record as returned by the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

impl User {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id: UserId(id),
            username: username.into(),
        }
    }
}

/// The user bound to a connection. Anonymous connections have no identity.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Principal {
    #[default]
    Anonymous,
    Authenticated(User),
}

impl Principal {
    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(user) => Some(user),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user().map(|u| u.id)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl From<User> for Principal {
    fn from(user: User) -> Self {
        Self::Authenticated(user)
    }
}

impl From<Option<User>> for Principal {
    fn from(user: Option<User>) -> Self {
        user.map_or(Self::Anonymous, Self::Authenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_has_no_id() {
        let p = Principal::Anonymous;
        assert!(p.is_anonymous());
        assert_eq!(p.user_id(), None);
    }

    #[test]
    fn authenticated_exposes_user() {
        let p = Principal::from(User::new(7, "ada"));
        assert!(!p.is_anonymous());
        assert_eq!(p.user_id(), Some(UserId(7)));
        assert_eq!(p.user().unwrap().username, "ada");
    }

    #[test]
    fn from_option() {
        assert!(Principal::from(None::<User>).is_anonymous());
        assert_eq!(Principal::from(Some(User::new(1, "a"))).user_id(), Some(UserId(1)));
    }

    #[test]
    fn user_id_is_transparent_integer() {
        assert_eq!(serde_json::to_string(&UserId(42)).unwrap(), "42");
        let id: UserId = serde_json::from_str("42").unwrap();
        assert_eq!(id, UserId(42));
    }
}
