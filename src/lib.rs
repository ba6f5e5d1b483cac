//! Session and authentication lifecycle for the HR admin console.
//!
//! The crate keeps a signed-in operator's bearer token and tenant selection
//! alive across backend calls: the gateway refreshes and retries on `401`,
//! the expiry watcher ends the session just before the token lapses, and the
//! route guards gate the tenant and super-admin areas.

pub mod auth;
pub mod config;
pub mod console;
pub mod gateway;
pub mod guards;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use auth::{AuthEvents, AuthSignal, AuthState, AuthUser, IdentityProvider, SignOutReason};
pub use config::{ConfigError, ConsoleConfig};
pub use console::{Console, Profile};
pub use gateway::{ApiError, ApiGateway, ApiRequest, GatewayError};
pub use guards::{GuardDecision, SuperAdminGuard, TenantGuard};
pub use session::{ExpiryWatcher, SessionContext, SessionStore};
pub use types::{TenantId, UserId};
