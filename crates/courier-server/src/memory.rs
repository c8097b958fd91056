//! In-process reference implementations of the collaborator ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_core::ports::{
    AuthGate, CacheError, ChannelLayer, ConnectionInfo, Directory, DirectoryError, PublishError,
    SessionCache,
};
use courier_core::{ConnectionId, Envelope, Frame, Principal, User, UserId};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Group fan-out over per-member unbounded inboxes.
///
/// Envelopes cross the layer as serialized group frames, the same way they
/// would through an external broker.
#[derive(Default)]
pub struct LocalChannelLayer {
    groups: DashMap<String, HashMap<ConnectionId, mpsc::UnboundedSender<Envelope>>>,
    published: AtomicU64,
}

impl LocalChannelLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |members| members.len())
    }

    /// Total envelopes published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChannelLayer for LocalChannelLayer {
    async fn join(
        &self,
        group: &str,
        connection: &ConnectionId,
        inbox: mpsc::UnboundedSender<Envelope>,
    ) -> Result<(), PublishError> {
        self.groups
            .entry(group.to_owned())
            .or_default()
            .insert(connection.clone(), inbox);
        debug!(group, connection_id = %connection, "joined group");
        Ok(())
    }

    async fn leave(&self, group: &str, connection: &ConnectionId) -> Result<(), PublishError> {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(connection);
        }
        self.groups.remove_if(group, |_, members| members.is_empty());
        debug!(group, connection_id = %connection, "left group");
        Ok(())
    }

    async fn publish(&self, group: &str, envelope: Envelope) -> Result<usize, PublishError> {
        let wire = serde_json::to_string(&envelope.to_group_frame())?;
        let envelope: Envelope = serde_json::from_str::<Frame>(&wire)?.into();
        self.published.fetch_add(1, Ordering::Relaxed);

        let Some(members) = self.groups.get(group) else {
            return Ok(0);
        };
        let delivered = members
            .values()
            .filter(|inbox| inbox.send(envelope.clone()).is_ok())
            .count();
        trace!(group, event = %envelope.name, delivered, "published");
        Ok(delivered)
    }
}

/// Key/value cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (Value, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live value under `key`. Expired entries are evicted on read.
    pub fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }
}

/// Fixed user table.
///
/// The connection's user comes from the request path (`/ws/{user_id}`) or
/// a `user_id` query parameter; unknown ids connect as anonymous.
#[derive(Default)]
pub struct StaticDirectory {
    users: Vec<User>,
}

impl StaticDirectory {
    pub fn new(users: Vec<User>) -> Self {
        Self { users }
    }

    fn by_id(&self, id: UserId) -> Option<User> {
        self.users.iter().find(|u| u.id == id).cloned()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup_user(&self, id: &UserId) -> Result<Option<User>, DirectoryError> {
        Ok(self.by_id(*id))
    }

    async fn lookup_username(&self, username: &str) -> Result<Option<User>, DirectoryError> {
        Ok(self.users.iter().find(|u| u.username == username).cloned())
    }

    async fn current_user(&self, info: &ConnectionInfo) -> Result<Principal, DirectoryError> {
        let id = info.path_user_id.or_else(|| {
            info.query
                .get("user_id")
                .and_then(|v| v.parse().ok())
                .map(UserId)
        });
        Ok(id.and_then(|id| self.by_id(id)).into())
    }
}

/// Accepts every connection.
pub struct AllowAll;

#[async_trait]
impl AuthGate for AllowAll {
    async fn authorize(&self, _info: &ConnectionInfo) -> bool {
        true
    }
}
