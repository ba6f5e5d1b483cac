//! Typed broadcast bus for session-ending signals.
//!
//! Code with no handle on the UI (the gateway, the expiry watcher) reports
//! that the user must sign in again by emitting on this bus; the application
//! root owns the subscribers and performs the redirect.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the broadcast channel. Slow subscribers lag, they never block
/// emitters.
const CHANNEL_CAPACITY: usize = 32;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum SignOutReason {
    /// The token reached its expiry (minus margin) and could not be renewed.
    Expired,
    /// The user signed out, or no user is signed in.
    SignedOut,
    /// Fetching a fresh token from the identity provider failed.
    RefreshFailed,
    /// The backend rejected the credential without giving a reason.
    Unauthorized,
    /// Reason reported by the backend in a `401` body.
    Server(String),
}

impl SignOutReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Expired => "expired",
            Self::SignedOut => "signedout",
            Self::RefreshFailed => "refresh-failed",
            Self::Unauthorized => "unauthorized",
            Self::Server(reason) => reason,
        }
    }
}

impl fmt::Display for SignOutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for SignOutReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "expired" => Self::Expired,
            "signedout" => Self::SignedOut,
            "refresh-failed" => Self::RefreshFailed,
            "unauthorized" => Self::Unauthorized,
            _ => Self::Server(s),
        }
    }
}

impl From<SignOutReason> for String {
    fn from(reason: SignOutReason) -> Self {
        reason.as_str().to_string()
    }
}

/// A signal on the auth bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSignal {
    /// The gateway gave up on the current credential.
    Expired { reason: SignOutReason },
    /// The expiry watcher is forcing the user back to sign-in.
    SignInRequired { reason: SignOutReason },
}

impl AuthSignal {
    pub fn reason(&self) -> &SignOutReason {
        match self {
            Self::Expired { reason } | Self::SignInRequired { reason } => reason,
        }
    }
}

/// Cloneable handle on the auth bus.
#[derive(Clone)]
pub struct AuthEvents {
    sender: broadcast::Sender<AuthSignal>,
}

impl Default for AuthEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthSignal> {
        self.sender.subscribe()
    }

    /// Emit a signal. Having no subscriber is not an error.
    pub fn emit(&self, signal: AuthSignal) {
        debug!("Auth signal: {:?}", signal);
        let _ = self.sender.send(signal);
    }

    /// Shorthand for the gateway's expiry broadcast.
    pub fn emit_expired(&self, reason: SignOutReason) {
        self.emit(AuthSignal::Expired { reason });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
