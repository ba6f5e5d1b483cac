//! Route guards for the protected areas of the console.
//!
//! Guards only read the session; they never modify it.

mod superadmin;
mod tenant;

pub use superadmin::{SUPERADMIN_LOGIN_PATH, SuperAdminGuard};
pub use tenant::TenantGuard;

use url::form_urlencoded;

use crate::auth::events::SignOutReason;

/// Tenant sign-in page.
pub const LOGIN_PATH: &str = "/login";

/// Outcome of a guard check for one navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// The identity check is still in flight; render nothing yet.
    Loading,
    /// Render the protected subtree.
    Allow,
    /// Navigate to this target instead.
    Redirect(String),
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn redirect_target(&self) -> Option<&str> {
        match self {
            Self::Redirect(target) => Some(target),
            _ => None,
        }
    }
}

/// Sign-in target carrying the reason and, when known, the path to return to.
pub fn sign_in_redirect(reason: &SignOutReason, from: Option<&str>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("reason", reason.as_str());
    if let Some(from) = from {
        query.append_pair("from", from);
    }
    format!("{}?{}", LOGIN_PATH, query.finish())
}
