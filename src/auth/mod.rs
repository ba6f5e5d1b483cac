//! Authentication: token inspection, identity providers and silent refresh.
//!
//! - `token` decodes the `exp` claim of a session token (no signature check)
//! - `provider` is the identity provider seam; `rest_provider` implements it
//!   against the hosted identity toolkit REST API
//! - `refresh` wraps a provider in a coalescing silent-refresh callback
//! - `events` is the auth bus every component reports session loss on
//!
//! Nothing in this module trusts a locally decoded claim for authorization;
//! role checks always go to the backend (see `guards::SuperAdminGuard`).

pub mod events;
pub mod provider;
pub mod refresh;
pub mod rest_provider;
pub mod token;

pub use events::{AuthEvents, AuthSignal, SignOutReason};
pub use provider::{AuthState, AuthUser, BoxFuture, IdentityChange, IdentityError, IdentityProvider};
pub use refresh::{
    FnRefresher, NoRefresher, ProviderRefresher, RefreshError, SilentRefresh, TokenRefresher,
};
pub use rest_provider::{RestIdentityConfig, RestIdentityProvider};
