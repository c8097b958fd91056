//! Collaborator ports.
//!
//! The routing core talks to the outside world only through these traits:
//! who may connect, who the users are, where session snapshots go, and how
//! envelopes fan out to a group. Reference in-memory implementations live in
//! `courier-server::memory`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::ids::ConnectionId;
use crate::user::{Principal, User, UserId};

/// What the transport knows about a connection at handshake time.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    /// User id taken from the request path (`/ws/{user_id}`).
    pub path_user_id: Option<UserId>,
    pub query: HashMap<String, String>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            path_user_id: None,
            query: HashMap::new(),
            connected_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_path_user(mut self, user_id: UserId) -> Self {
        self.path_user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.query.get("token").map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("invalid lookup value for {field}: {value}")]
    InvalidValue { field: String, value: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("channel layer unavailable: {0}")]
    Unavailable(String),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Decides whether a connection may be accepted at all.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn authorize(&self, info: &ConnectionInfo) -> bool;
}

/// Read-only user directory.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup_user(&self, id: &UserId) -> Result<Option<User>, DirectoryError>;

    async fn lookup_username(&self, username: &str) -> Result<Option<User>, DirectoryError>;

    /// Principal bound to a connection at handshake time.
    async fn current_user(&self, info: &ConnectionInfo) -> Result<Principal, DirectoryError>;
}

/// Key/value store with expiry, used only for session snapshots.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;
}

/// Group fan-out. Every member of a group, the publisher included, receives
/// each published envelope on its inbox.
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    async fn join(
        &self,
        group: &str,
        connection: &ConnectionId,
        inbox: mpsc::UnboundedSender<Envelope>,
    ) -> Result<(), PublishError>;

    async fn leave(&self, group: &str, connection: &ConnectionId) -> Result<(), PublishError>;

    /// Returns the number of members the envelope was handed to.
    async fn publish(&self, group: &str, envelope: Envelope) -> Result<usize, PublishError>;
}
