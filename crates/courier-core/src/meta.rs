use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, EventId};
use crate::user::{Principal, UserId};

/// Routing metadata attached once per inbound event and carried unchanged
/// to every group member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMeta {
    pub initiator_connection: ConnectionId,
    pub initiator_user_id: Option<UserId>,
    pub event_id: EventId,
}

impl SystemMeta {
    /// Fresh metadata for an event originating on `connection`.
    pub fn originate(connection: &ConnectionId, principal: &Principal) -> Self {
        Self {
            initiator_connection: connection.clone(),
            initiator_user_id: principal.user_id(),
            event_id: EventId::new(),
        }
    }
}

/// `SystemMeta` as seen by one receiving connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMeta {
    pub system: SystemMeta,
    pub receiver_connection: ConnectionId,
}

impl MessageMeta {
    pub fn new(system: SystemMeta, receiver_connection: ConnectionId) -> Self {
        Self {
            system,
            receiver_connection,
        }
    }

    pub fn event_id(&self) -> &EventId {
        &self.system.event_id
    }

    pub fn initiator_user_id(&self) -> Option<UserId> {
        self.system.initiator_user_id
    }

    /// Whether the receiving connection is the one the event came from.
    pub fn is_loopback(&self) -> bool {
        self.system.initiator_connection == self.receiver_connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::User;

    #[test]
    fn originate_captures_connection_and_user() {
        let conn = ConnectionId::new();
        let meta = SystemMeta::originate(&conn, &Principal::from(User::new(3, "c")));
        assert_eq!(meta.initiator_connection, conn);
        assert_eq!(meta.initiator_user_id, Some(UserId(3)));
    }

    #[test]
    fn originate_generates_distinct_event_ids() {
        let conn = ConnectionId::new();
        let a = SystemMeta::originate(&conn, &Principal::Anonymous);
        let b = SystemMeta::originate(&conn, &Principal::Anonymous);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.initiator_user_id, None);
    }

    #[test]
    fn loopback_detection() {
        let sender = ConnectionId::new();
        let system = SystemMeta::originate(&sender, &Principal::Anonymous);
        assert!(MessageMeta::new(system.clone(), sender).is_loopback());
        assert!(!MessageMeta::new(system, ConnectionId::new()).is_loopback());
    }
}
