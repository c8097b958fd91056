use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::ports::{Directory, DirectoryError};
use courier_core::{LookupCriteria, User, UserId};
use serde_json::Value;

/// Turns one lookup value into a user.
#[async_trait]
pub trait LookupResolver: Send + Sync {
    async fn resolve(
        &self,
        value: &Value,
        directory: &dyn Directory,
    ) -> Result<Option<User>, DirectoryError>;
}

/// `to_user_id`: integer id, or a string holding one.
pub struct ById;

#[async_trait]
impl LookupResolver for ById {
    async fn resolve(
        &self,
        value: &Value,
        directory: &dyn Directory,
    ) -> Result<Option<User>, DirectoryError> {
        let id = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        match id {
            Some(id) => directory.lookup_user(&UserId(id)).await,
            None => Ok(None),
        }
    }
}

/// `to_username`: exact username.
pub struct ByUsername;

#[async_trait]
impl LookupResolver for ByUsername {
    async fn resolve(
        &self,
        value: &Value,
        directory: &dyn Directory,
    ) -> Result<Option<User>, DirectoryError> {
        match value.as_str() {
            Some(name) => directory.lookup_username(name).await,
            None => Ok(None),
        }
    }
}

/// Ordered `field -> resolver` table.
///
/// Tables are values: a connection type builds its own from the default one
/// and hands it to every pass explicitly.
#[derive(Clone)]
pub struct ResolverTable {
    entries: Vec<(String, Arc<dyn LookupResolver>)>,
}

impl ResolverTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a resolver, or replace the one already registered for `field`.
    #[must_use]
    pub fn with_resolver(
        mut self,
        field: impl Into<String>,
        resolver: Arc<dyn LookupResolver>,
    ) -> Self {
        let field = field.into();
        match self.entries.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = resolver,
            None => self.entries.push((field, resolver)),
        }
        self
    }

    /// Keep only the listed fields, in table order.
    #[must_use]
    pub fn restricted_to<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.entries
            .retain(|(f, _)| fields.iter().any(|keep| keep.as_ref() == f));
        self
    }

    /// Lookup fields, in table order.
    pub fn fields(&self) -> Vec<&str> {
        self.entries.iter().map(|(f, _)| f.as_str()).collect()
    }

    pub fn criteria(&self, payload: &serde_json::Map<String, Value>) -> LookupCriteria {
        LookupCriteria::extract(payload, &self.fields())
    }

    /// Walk populated criteria in order; the first resolver that finds a
    /// user wins. Fields without a resolver are ignored.
    pub async fn resolve(
        &self,
        criteria: &LookupCriteria,
        directory: &dyn Directory,
    ) -> Result<Option<User>, DirectoryError> {
        for (field, value) in criteria.iter() {
            let Some((_, resolver)) = self.entries.iter().find(|(f, _)| f == field) else {
                continue;
            };
            if let Some(user) = resolver.resolve(value, directory).await? {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }
}

impl Default for ResolverTable {
    fn default() -> Self {
        Self::empty()
            .with_resolver("user_id", Arc::new(ById))
            .with_resolver("username", Arc::new(ByUsername))
    }
}

impl fmt::Debug for ResolverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverTable")
            .field("fields", &self.fields())
            .finish()
    }
}
