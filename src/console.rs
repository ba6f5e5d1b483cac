//! Application root: wires the session lifecycle together.
//!
//! `Console` owns the session store, identity provider, auth bus, gateway
//! and guards, and runs the root signal handler that ends the local session
//! whenever a component reports that the credential is gone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::events::{AuthEvents, AuthSignal, SignOutReason};
use crate::auth::provider::{AuthUser, IdentityProvider};
use crate::auth::refresh::{ProviderRefresher, SilentRefresh};
use crate::auth::rest_provider::RestIdentityProvider;
use crate::config::ConsoleConfig;
use crate::gateway::{ApiGateway, build_http_client};
use crate::guards::{SuperAdminGuard, TenantGuard, sign_in_redirect};
use crate::session::{ExpiryWatcher, FileSessionStore, SessionContext, SessionStore};
use crate::types::TenantId;

/// Profile endpoint used to pick the tenant after sign-in.
pub const PROFILE_PATH: &str = "/me";

/// The signed-in user's profile, as far as tenant selection needs it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub role: Option<String>,
}

impl Profile {
    /// Tenant named directly on the profile, else the first membership.
    pub fn preferred_tenant(&self) -> Option<TenantId> {
        self.tenant_id
            .clone()
            .or_else(|| self.memberships.first().map(|m| m.tenant_id.clone()))
    }
}

pub struct Console {
    config: ConsoleConfig,
    session: SessionContext,
    provider: Arc<RestIdentityProvider>,
    events: AuthEvents,
    gateway: ApiGateway,
    tenant_guard: TenantGuard,
    superadmin_guard: SuperAdminGuard,
    redirect: Arc<watch::Sender<Option<String>>>,
    signal_handler: JoinHandle<()>,
}

impl Console {
    /// Build a console persisting its session to the configured file.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: ConsoleConfig) -> Result<Self> {
        let store = FileSessionStore::open(&config.session_file).with_context(|| {
            format!("Failed to open session file {}", config.session_file.display())
        })?;
        Self::with_store(config, Arc::new(store))
    }

    /// Build a console over an explicit session store.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_store(config: ConsoleConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        config.validate()?;

        let client = build_http_client(config.request_timeout())?;
        let session = SessionContext::new(store.clone());
        let events = AuthEvents::new();

        let provider = Arc::new(
            RestIdentityProvider::new(client.clone(), config.identity_config()).with_store(store),
        );
        let refresh = Arc::new(SilentRefresh::new(
            Arc::new(ProviderRefresher::new(provider.clone())),
            session.clone(),
        ));
        let gateway = ApiGateway::new(
            client.clone(),
            config.api_url.clone(),
            session.clone(),
            refresh,
            events.clone(),
        )
        .with_margin_ms(config.expiry_margin_ms);

        let tenant_guard = TenantGuard::new(session.clone()).with_margin_ms(config.expiry_margin_ms);
        let superadmin_guard =
            SuperAdminGuard::new(client, config.superadmin_verify_url(), provider.clone());

        let redirect = Arc::new(watch::Sender::new(None));
        let signal_handler = tokio::spawn(handle_signals(
            events.subscribe(),
            session.clone(),
            redirect.clone(),
        ));

        Ok(Self {
            config,
            session,
            provider,
            events,
            gateway,
            tenant_guard,
            superadmin_guard,
            redirect,
            signal_handler,
        })
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn provider(&self) -> &Arc<RestIdentityProvider> {
        &self.provider
    }

    pub fn events(&self) -> &AuthEvents {
        &self.events
    }

    pub fn gateway(&self) -> &ApiGateway {
        &self.gateway
    }

    pub fn tenant_guard(&self) -> &TenantGuard {
        &self.tenant_guard
    }

    pub fn superadmin_guard(&self) -> &SuperAdminGuard {
        &self.superadmin_guard
    }

    /// Latest sign-in redirect recorded by the signal handler.
    pub fn redirect_target(&self) -> Option<String> {
        self.redirect.borrow().clone()
    }

    pub fn watch_redirects(&self) -> watch::Receiver<Option<String>> {
        self.redirect.subscribe()
    }

    /// Resume the persisted identity session and re-store its token.
    pub async fn restore(&self) -> Result<Option<AuthUser>> {
        let Some(user) = self.provider.restore().await? else {
            return Ok(None);
        };
        let token = self.provider.id_token(false).await?;
        self.session.set_token(&token)?;
        Ok(Some(user))
    }

    /// Sign in and select a tenant.
    ///
    /// The tenant is `tenant` when given, else derived from the profile,
    /// else the configured default. Signing in without any tenant is allowed.
    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        tenant: Option<TenantId>,
    ) -> Result<AuthUser> {
        let user = self.provider.sign_in_with_password(email, password).await?;
        let token = self.provider.id_token(false).await?;
        self.session.set_token(&token)?;
        self.redirect.send_replace(None);

        let tenant = match tenant {
            Some(tenant) => Some(tenant),
            None => self.derive_tenant().await,
        };
        match tenant {
            Some(tenant) => {
                info!("Using tenant {}", tenant);
                self.session.set_tenant_id(&tenant)?;
            }
            None => warn!("No tenant could be determined for {}", user.uid),
        }

        Ok(user)
    }

    /// Sign out and clear the local session.
    pub async fn sign_out(&self) -> Result<()> {
        self.provider.sign_out().await?;
        self.session.clear()?;
        self.redirect
            .send_replace(Some(sign_in_redirect(&SignOutReason::SignedOut, None)));
        Ok(())
    }

    /// Mount the expiry watcher on this console's session.
    pub fn mount_watcher(&self) -> ExpiryWatcher {
        ExpiryWatcher::mount(
            self.provider.clone(),
            self.session.clone(),
            self.events.clone(),
            self.config.expiry_margin_ms,
        )
    }

    /// Keep the identity token renewed `lead` ahead of its expiry.
    pub fn spawn_auto_refresh(&self, lead: Duration) -> JoinHandle<()> {
        self.provider.spawn_auto_refresh(lead)
    }

    async fn derive_tenant(&self) -> Option<TenantId> {
        match self.gateway.get_json::<Profile>(PROFILE_PATH).await {
            Ok(profile) => {
                if let Some(tenant) = profile.preferred_tenant() {
                    return Some(tenant);
                }
                debug!("Profile names no tenant");
            }
            Err(e) => warn!("Could not load profile: {}", e),
        }
        self.config.default_tenant.clone()
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.signal_handler.abort();
    }
}

/// Root handler for session-ending signals.
async fn handle_signals(
    mut signals: broadcast::Receiver<AuthSignal>,
    session: SessionContext,
    redirect: Arc<watch::Sender<Option<String>>>,
) {
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Signal handler missed {} auth signals", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let reason = signal.reason();
        info!("Session ended ({})", reason);

        if let Err(e) = session.clear_token() {
            warn!("Failed to clear session token: {}", e);
        }
        if *reason == SignOutReason::SignedOut
            && let Err(e) = session.clear_tenant_id()
        {
            warn!("Failed to clear tenant: {}", e);
        }
        redirect.send_replace(Some(sign_in_redirect(reason, None)));
    }
}
