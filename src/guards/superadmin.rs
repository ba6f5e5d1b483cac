use std::sync::Arc;

use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use tracing::{debug, info, warn};

use super::GuardDecision;
use crate::auth::provider::IdentityProvider;

/// Super-admin sign-in page.
pub const SUPERADMIN_LOGIN_PATH: &str = "/superadmin/login";

/// Gate for the super-admin area.
///
/// The role is verified by the backend on every check with a freshly minted
/// token. Nothing is cached between checks.
#[derive(Clone)]
pub struct SuperAdminGuard {
    client: Client,
    verify_url: String,
    provider: Arc<dyn IdentityProvider>,
}

impl SuperAdminGuard {
    pub fn new(
        client: Client,
        verify_url: impl Into<String>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            client,
            verify_url: verify_url.into(),
            provider,
        }
    }

    pub fn verify_url(&self) -> &str {
        &self.verify_url
    }

    /// Decision to render while `check` is pending.
    pub fn pending(&self) -> GuardDecision {
        GuardDecision::Loading
    }

    /// Verify the current user's role with the backend.
    ///
    /// Every failure is reported the same way: a redirect to the
    /// super-admin sign-in page.
    pub async fn check(&self) -> GuardDecision {
        match self.verify().await {
            Ok(()) => {
                debug!("Super-admin role verified");
                GuardDecision::Allow
            }
            Err(reason) => {
                info!("Super-admin check failed: {}", reason);
                GuardDecision::Redirect(SUPERADMIN_LOGIN_PATH.to_string())
            }
        }
    }

    async fn verify(&self) -> Result<(), String> {
        if self.provider.current_user().is_none() {
            return Err("no signed-in user".into());
        }

        let token = self
            .provider
            .id_token(true)
            .await
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .get(&self.verify_url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| {
                warn!("Super-admin verification request failed: {}", e);
                e.to_string()
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("verification endpoint returned {}", status))
        }
    }
}
