//! Identity provider seam.
//!
//! The console never talks to the identity service directly; it goes
//! through `IdentityProvider`, which owns the signed-in user's in-memory
//! session and announces changes to it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::UserId;

/// Boxed future returned by the object-safe provider traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The signed-in user as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub uid: UserId,
    #[serde(default)]
    pub email: Option<String>,
}

impl AuthUser {
    pub fn new(uid: impl Into<UserId>, email: Option<String>) -> Self {
        Self {
            uid: uid.into(),
            email,
        }
    }
}

/// Result of the provider's identity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// The provider has not finished restoring its session yet.
    Resolving,
    SignedIn(AuthUser),
    SignedOut,
}

impl AuthState {
    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            Self::SignedIn(user) => Some(user),
            _ => None,
        }
    }
}

/// Change notifications delivered to `IdentityProvider::subscribe` receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityChange {
    /// Sign-in or sign-out.
    AuthStateChanged(Option<AuthUser>),
    /// A new id token was issued (sign-in or refresh).
    TokenChanged(Option<AuthUser>),
}

/// Errors reported by an identity provider.
#[derive(Debug, Clone)]
pub enum IdentityError {
    /// No user is signed in.
    NoActiveUser,
    /// The provider is missing required configuration.
    NotConfigured(String),
    /// The provider could not be reached.
    Network(String),
    /// The provider refused the request.
    Rejected { status: u16, message: String },
    /// The provider answered with something unparseable.
    InvalidResponse(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveUser => write!(f, "No signed-in user"),
            Self::NotConfigured(msg) => write!(f, "Identity provider not configured: {}", msg),
            Self::Network(msg) => write!(f, "Identity provider unreachable: {}", msg),
            Self::Rejected { status, message } => {
                write!(f, "Identity provider rejected request ({}): {}", status, message)
            }
            Self::InvalidResponse(msg) => write!(f, "Invalid identity provider response: {}", msg),
        }
    }
}

impl std::error::Error for IdentityError {}

/// An identity service holding the user's live session.
pub trait IdentityProvider: Send + Sync {
    /// Current identity check state.
    fn auth_state(&self) -> AuthState;

    /// The signed-in user, if any.
    fn current_user(&self) -> Option<AuthUser> {
        self.auth_state().user().cloned()
    }

    /// An id token for the current user.
    ///
    /// With `force_refresh` the provider mints a new token even if the
    /// current one is still valid.
    fn id_token(&self, force_refresh: bool) -> BoxFuture<'_, Result<String, IdentityError>>;

    fn sign_in_with_password<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<AuthUser, IdentityError>>;

    fn sign_out(&self) -> BoxFuture<'_, Result<(), IdentityError>>;

    /// Receive future auth-state and token changes.
    fn subscribe(&self) -> broadcast::Receiver<IdentityChange>;
}
