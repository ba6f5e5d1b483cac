//! Session state: the bearer token and selected tenant.
//!
//! `SessionContext` is the injected handle every other component reads the
//! session through. It never validates what it stores; callers decide
//! whether a token is still usable (see `auth::token`).
//!
//! The expiry watcher in `watcher` proactively ends a session shortly before
//! its token would be rejected.

pub mod store;
pub mod watcher;

use std::sync::Arc;

use crate::types::TenantId;

pub use store::{FileSessionStore, MemorySessionStore, SessionStore, SessionStoreError};
pub use watcher::{ExpiryWatcher, WatcherState};

/// Storage key for the bearer token.
pub const TOKEN_KEY: &str = "token";

/// Storage key for the selected tenant.
pub const TENANT_KEY: &str = "tenantId";

/// Shared handle over the session store.
#[derive(Clone)]
pub struct SessionContext {
    store: Arc<dyn SessionStore>,
}

impl SessionContext {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// A session backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()))
    }

    /// The underlying store, for components that keep their own keys in it.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Current bearer token; an empty stored value counts as absent.
    pub fn token(&self) -> Option<String> {
        self.store.get(TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn set_token(&self, token: &str) -> Result<(), SessionStoreError> {
        self.store.set(TOKEN_KEY, token)
    }

    pub fn clear_token(&self) -> Result<(), SessionStoreError> {
        self.store.remove(TOKEN_KEY)
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.store
            .get(TENANT_KEY)
            .filter(|t| !t.is_empty())
            .map(TenantId::from)
    }

    pub fn set_tenant_id(&self, tenant_id: &TenantId) -> Result<(), SessionStoreError> {
        self.store.set(TENANT_KEY, tenant_id.as_str())
    }

    pub fn clear_tenant_id(&self) -> Result<(), SessionStoreError> {
        self.store.remove(TENANT_KEY)
    }

    /// Remove both token and tenant.
    pub fn clear(&self) -> Result<(), SessionStoreError> {
        self.clear_token()?;
        self.clear_tenant_id()
    }
}
