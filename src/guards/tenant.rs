use tracing::debug;

use super::{GuardDecision, sign_in_redirect};
use crate::auth::events::SignOutReason;
use crate::auth::provider::AuthState;
use crate::auth::token::{self, DEFAULT_EXPIRY_MARGIN_MS};
use crate::session::SessionContext;

/// Gate for the tenant area: requires a signed-in user and a live stored token.
#[derive(Clone)]
pub struct TenantGuard {
    session: SessionContext,
    margin_ms: i64,
}

impl TenantGuard {
    pub fn new(session: SessionContext) -> Self {
        Self {
            session,
            margin_ms: DEFAULT_EXPIRY_MARGIN_MS,
        }
    }

    pub fn with_margin_ms(mut self, margin_ms: i64) -> Self {
        self.margin_ms = margin_ms;
        self
    }

    /// Decide whether `original_path` may render for the given identity state.
    pub fn check(&self, state: &AuthState, original_path: &str) -> GuardDecision {
        if matches!(state, AuthState::Resolving) {
            return GuardDecision::Loading;
        }

        let reason = match (state.user(), self.session.token()) {
            (None, _) | (Some(_), None) => SignOutReason::SignedOut,
            (Some(_), Some(token)) if token::is_expired(Some(token.as_str()), self.margin_ms) => {
                SignOutReason::Expired
            }
            (Some(_), Some(_)) => return GuardDecision::Allow,
        };

        debug!("Tenant guard redirecting {} ({})", original_path, reason);
        GuardDecision::Redirect(sign_in_redirect(&reason, Some(original_path)))
    }
}
