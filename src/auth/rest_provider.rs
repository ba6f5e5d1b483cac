//! Identity provider backed by the hosted identity toolkit REST API.
//!
//! Password sign-in goes to `accounts:signInWithPassword`; id tokens are
//! renewed by exchanging the refresh token at the secure-token endpoint.
//! The provider owns the live session in memory and, when given a store,
//! persists the user and refresh token so a later process can `restore()`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::provider::{
    AuthState, AuthUser, BoxFuture, IdentityChange, IdentityError, IdentityProvider,
};
use crate::auth::token;
use crate::session::SessionStore;
use crate::types::UserId;

/// Storage key for the persisted user.
pub const USER_KEY: &str = "identity.user";

/// Storage key for the persisted refresh token.
pub const REFRESH_TOKEN_KEY: &str = "identity.refreshToken";

/// Delay before retrying a failed or ineffective background refresh.
const AUTO_REFRESH_RETRY: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 32;

/// How close to its real `exp` a cached id token is renewed on read.
///
/// Independent of the console's expiry margin: the watcher and gateway apply
/// their own margin, the provider only renews tokens about to lapse.
pub const DEFAULT_REFRESH_BUFFER_MS: i64 = 30_000;

/// Endpoints and credentials for the identity service.
#[derive(Debug, Clone)]
pub struct RestIdentityConfig {
    pub identity_url: String,
    pub securetoken_url: String,
    pub api_key: Option<String>,
    pub refresh_buffer_ms: i64,
}

impl Default for RestIdentityConfig {
    fn default() -> Self {
        Self {
            identity_url: "https://identitytoolkit.googleapis.com".to_string(),
            securetoken_url: "https://securetoken.googleapis.com".to_string(),
            api_key: None,
            refresh_buffer_ms: DEFAULT_REFRESH_BUFFER_MS,
        }
    }
}

#[derive(Debug, Clone)]
struct Credentials {
    user: AuthUser,
    id_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    id_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<ProviderErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

pub struct RestIdentityProvider {
    client: Client,
    config: RestIdentityConfig,
    credentials: Mutex<Option<Credentials>>,
    state: watch::Sender<AuthState>,
    changes: broadcast::Sender<IdentityChange>,
    store: Option<Arc<dyn SessionStore>>,
}

impl RestIdentityProvider {
    /// Create a provider in the `Resolving` state. Call `restore()` to
    /// settle it.
    pub fn new(client: Client, config: RestIdentityConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            client,
            config,
            credentials: Mutex::new(None),
            state: watch::Sender::new(AuthState::Resolving),
            changes,
            store: None,
        }
    }

    /// Persist the session into `store`.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Observe identity check state transitions.
    pub fn watch_state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Resume a persisted session, if any.
    ///
    /// Always leaves the provider out of `Resolving`. A refresh token the
    /// service rejects is discarded.
    pub async fn restore(&self) -> Result<Option<AuthUser>, IdentityError> {
        let persisted = self.store.as_ref().and_then(|store| {
            let refresh_token = store.get(REFRESH_TOKEN_KEY)?;
            let user = serde_json::from_str::<AuthUser>(&store.get(USER_KEY)?).ok()?;
            Some((user, refresh_token))
        });

        let Some((user, refresh_token)) = persisted else {
            debug!("No persisted identity session");
            self.state.send_replace(AuthState::SignedOut);
            return Ok(None);
        };

        match self.exchange_refresh_token(&refresh_token).await {
            Ok(response) => {
                let credentials = Credentials {
                    user: user.clone(),
                    id_token: response.id_token,
                    refresh_token: response.refresh_token,
                };
                self.persist(&credentials);
                *self.credentials.lock().await = Some(credentials);
                self.state.send_replace(AuthState::SignedIn(user.clone()));
                info!("Restored identity session for {}", user.uid);
                self.notify(IdentityChange::AuthStateChanged(Some(user.clone())));
                self.notify(IdentityChange::TokenChanged(Some(user.clone())));
                Ok(Some(user))
            }
            Err(err) => {
                if matches!(err, IdentityError::Rejected { .. }) {
                    warn!("Persisted session rejected: {}", err);
                    self.forget();
                }
                self.state.send_replace(AuthState::SignedOut);
                Err(err)
            }
        }
    }

    /// Renew the id token in the background `lead` before it expires.
    ///
    /// Every renewal is announced as `TokenChanged`, so an expiry watcher
    /// rearms instead of firing.
    pub fn spawn_auto_refresh(self: &Arc<Self>, lead: Duration) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        let mut changes = provider.subscribe();
        let lead_ms = lead.as_millis() as i64;

        tokio::spawn(async move {
            let mut just_refreshed = false;
            loop {
                let expires_at = provider
                    .credentials
                    .lock()
                    .await
                    .as_ref()
                    .map(|c| token::expires_at_ms(&c.id_token))
                    .filter(|at| *at > 0);

                let Some(expires_at) = expires_at else {
                    match changes.recv().await {
                        Err(broadcast::error::RecvError::Closed) => break,
                        _ => continue,
                    }
                };

                let due = Duration::from_millis((expires_at - token::now_ms() - lead_ms).max(0) as u64);
                let wait = if due.is_zero() && just_refreshed {
                    debug!("Renewed token is already inside the refresh lead; backing off");
                    AUTO_REFRESH_RETRY
                } else {
                    just_refreshed = false;
                    due
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        match provider.id_token(true).await {
                            Ok(_) => just_refreshed = true,
                            Err(e) => {
                                warn!("Background token refresh failed: {}", e);
                                tokio::time::sleep(AUTO_REFRESH_RETRY).await;
                            }
                        }
                    }
                    change = changes.recv() => {
                        if matches!(change, Err(broadcast::error::RecvError::Closed)) {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn endpoint(&self, base: &str, path: &str) -> Result<Url, IdentityError> {
        let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))
            .map_err(|e| IdentityError::NotConfigured(format!("invalid endpoint {}: {}", base, e)))?;
        if let Some(key) = &self.config.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        body: serde_json::Value,
    ) -> Result<T, IdentityError> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| IdentityError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.bytes().await.unwrap_or_default();
            let message = serde_json::from_slice::<ProviderErrorBody>(&raw)
                .ok()
                .and_then(|b| b.error)
                .and_then(|d| d.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&raw).trim().to_string());
            return Err(IdentityError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| IdentityError::InvalidResponse(e.to_string()))
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, IdentityError> {
        let url = self.endpoint(&self.config.securetoken_url, "/v1/token")?;
        self.post(
            url,
            json!({ "grant_type": "refresh_token", "refresh_token": refresh_token }),
        )
        .await
    }

    async fn request_sign_in(&self, email: &str, password: &str) -> Result<SignInResponse, IdentityError> {
        let url = self.endpoint(&self.config.identity_url, "/v1/accounts:signInWithPassword")?;
        self.post(
            url,
            json!({ "email": email, "password": password, "returnSecureToken": true }),
        )
        .await
    }

    fn persist(&self, credentials: &Credentials) {
        let Some(store) = &self.store else {
            return;
        };
        let user = match serde_json::to_string(&credentials.user) {
            Ok(user) => user,
            Err(e) => {
                warn!("Failed to serialize identity user: {}", e);
                return;
            }
        };
        if let Err(e) = store
            .set(USER_KEY, &user)
            .and_then(|_| store.set(REFRESH_TOKEN_KEY, &credentials.refresh_token))
        {
            warn!("Failed to persist identity session: {}", e);
        }
    }

    fn forget(&self) {
        if let Some(store) = &self.store
            && let Err(e) = store
                .remove(USER_KEY)
                .and_then(|_| store.remove(REFRESH_TOKEN_KEY))
        {
            warn!("Failed to clear persisted identity session: {}", e);
        }
    }

    fn notify(&self, change: IdentityChange) {
        let _ = self.changes.send(change);
    }

    async fn end_session(&self) {
        *self.credentials.lock().await = None;
        self.forget();
        self.state.send_replace(AuthState::SignedOut);
        self.notify(IdentityChange::AuthStateChanged(None));
    }
}

impl IdentityProvider for RestIdentityProvider {
    fn auth_state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    fn id_token(&self, force_refresh: bool) -> BoxFuture<'_, Result<String, IdentityError>> {
        Box::pin(async move {
            let mut guard = self.credentials.lock().await;
            let credentials = guard.as_mut().ok_or(IdentityError::NoActiveUser)?;

            if !force_refresh
                && !token::is_expired(Some(credentials.id_token.as_str()), self.config.refresh_buffer_ms)
            {
                return Ok(credentials.id_token.clone());
            }

            let response = match self.exchange_refresh_token(&credentials.refresh_token).await {
                Ok(response) => response,
                Err(err @ IdentityError::Rejected { .. }) => {
                    warn!("Refresh token rejected, ending session: {}", err);
                    drop(guard);
                    self.end_session().await;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };

            if let Some(uid) = response.user_id.as_deref()
                && uid != credentials.user.uid.as_str()
            {
                warn!("Refreshed token belongs to {} instead of {}", uid, credentials.user.uid);
            }

            credentials.id_token = response.id_token;
            credentials.refresh_token = response.refresh_token;
            self.persist(credentials);

            let user = credentials.user.clone();
            let id_token = credentials.id_token.clone();
            drop(guard);

            debug!(
                "Identity token renewed (expires at {})",
                token::expires_at_ms(&id_token)
            );
            self.notify(IdentityChange::TokenChanged(Some(user)));
            Ok(id_token)
        })
    }

    fn sign_in_with_password<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<AuthUser, IdentityError>> {
        Box::pin(async move {
            let response = match self.request_sign_in(email, password).await {
                Ok(response) => response,
                Err(err) => {
                    // A failed first sign-in still settles the identity check.
                    self.state.send_if_modified(|state| {
                        let resolving = matches!(state, AuthState::Resolving);
                        if resolving {
                            *state = AuthState::SignedOut;
                        }
                        resolving
                    });
                    return Err(err);
                }
            };

            let user = AuthUser {
                uid: UserId::new(response.local_id),
                email: response.email.or_else(|| Some(email.to_string())),
            };
            let credentials = Credentials {
                user: user.clone(),
                id_token: response.id_token,
                refresh_token: response.refresh_token,
            };
            self.persist(&credentials);
            *self.credentials.lock().await = Some(credentials);
            self.state.send_replace(AuthState::SignedIn(user.clone()));

            info!("Signed in as {}", user.uid);
            self.notify(IdentityChange::AuthStateChanged(Some(user.clone())));
            self.notify(IdentityChange::TokenChanged(Some(user.clone())));
            Ok(user)
        })
    }

    fn sign_out(&self) -> BoxFuture<'_, Result<(), IdentityError>> {
        Box::pin(async move {
            self.end_session().await;
            info!("Signed out");
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<IdentityChange> {
        self.changes.subscribe()
    }
}
