//! Silent token refresh.
//!
//! `SilentRefresh` is the only place a new token is minted on behalf of a
//! request. It is a pure boolean probe for callers: every failure (no
//! provider session, no user, network) collapses into "not refreshed".
//!
//! Concurrent refreshes are coalesced. Each caller states the refresh epoch
//! it observed when its request started; a caller that waited behind a
//! refresh completed after that point reuses its outcome instead of minting
//! another token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::provider::{BoxFuture, IdentityError, IdentityProvider};
use crate::session::SessionContext;

/// Why a refresh attempt produced no token.
#[derive(Debug, Clone)]
pub enum RefreshError {
    /// No identity provider session to refresh from.
    Unavailable,
    /// The provider failed to mint a token.
    Identity(IdentityError),
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "No session available to refresh"),
            Self::Identity(err) => write!(f, "Token refresh failed: {}", err),
        }
    }
}

impl std::error::Error for RefreshError {}

impl From<IdentityError> for RefreshError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NoActiveUser => Self::Unavailable,
            other => Self::Identity(other),
        }
    }
}

/// Source of fresh tokens, injected into the gateway at construction.
pub trait TokenRefresher: Send + Sync {
    fn refresh_token(&self) -> BoxFuture<'_, Result<String, RefreshError>>;
}

/// Refreshes by forcing the identity provider to re-mint its id token.
pub struct ProviderRefresher {
    provider: Arc<dyn IdentityProvider>,
}

impl ProviderRefresher {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }
}

impl TokenRefresher for ProviderRefresher {
    fn refresh_token(&self) -> BoxFuture<'_, Result<String, RefreshError>> {
        Box::pin(async move {
            if self.provider.current_user().is_none() {
                return Err(RefreshError::Unavailable);
            }
            Ok(self.provider.id_token(true).await?)
        })
    }
}

/// Adapts an async closure into a `TokenRefresher`.
pub struct FnRefresher<F>(pub F);

impl<F, Fut> TokenRefresher for FnRefresher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, RefreshError>> + Send + 'static,
{
    fn refresh_token(&self) -> BoxFuture<'_, Result<String, RefreshError>> {
        Box::pin((self.0)())
    }
}

/// Refresher used when no identity provider is wired up.
pub struct NoRefresher;

impl TokenRefresher for NoRefresher {
    fn refresh_token(&self) -> BoxFuture<'_, Result<String, RefreshError>> {
        Box::pin(async { Err(RefreshError::Unavailable) })
    }
}

/// Coalescing, persisting wrapper around a `TokenRefresher`.
pub struct SilentRefresh {
    refresher: Arc<dyn TokenRefresher>,
    session: SessionContext,
    inflight: Mutex<()>,
    epoch: AtomicU64,
    last_ok: AtomicBool,
}

impl SilentRefresh {
    pub fn new(refresher: Arc<dyn TokenRefresher>, session: SessionContext) -> Self {
        Self {
            refresher,
            session,
            inflight: Mutex::new(()),
            epoch: AtomicU64::new(0),
            last_ok: AtomicBool::new(false),
        }
    }

    /// Number of refresh attempts completed so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Refresh now. Returns whether a fresh token is stored.
    pub async fn refresh(&self) -> bool {
        self.refresh_since(self.epoch()).await.is_some()
    }

    /// Refresh unless a refresh completed after `observed_epoch`.
    ///
    /// Returns the token to use, or `None` when no fresh token is available.
    pub async fn refresh_since(&self, observed_epoch: u64) -> Option<String> {
        let _guard = self.inflight.lock().await;

        if self.epoch() != observed_epoch {
            let reused = self.last_ok.load(Ordering::Acquire);
            debug!("Reusing concurrent refresh outcome (ok={})", reused);
            return if reused { self.session.token() } else { None };
        }

        let outcome = match self.refresher.refresh_token().await {
            Ok(token) => {
                if let Err(e) = self.session.set_token(&token) {
                    warn!("Refreshed token could not be persisted: {}", e);
                }
                info!(
                    "Session token refreshed (expires at {})",
                    crate::auth::token::expires_at_ms(&token)
                );
                Some(token)
            }
            Err(e) => {
                debug!("Silent refresh failed: {}", e);
                None
            }
        };

        self.last_ok.store(outcome.is_some(), Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::stub::StubIdentityProvider;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_refresher(
        calls: Arc<AtomicUsize>,
        result: Result<&'static str, ()>,
    ) -> Arc<dyn TokenRefresher> {
        Arc::new(FnRefresher(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                result
                    .map(str::to_string)
                    .map_err(|_| RefreshError::Unavailable)
            }
        }))
    }

    #[tokio::test]
    async fn test_refresh_persists_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let session = SessionContext::in_memory();
        let refresh = SilentRefresh::new(counting_refresher(calls.clone(), Ok("fresh")), session.clone());

        assert!(refresh.refresh().await);
        assert_eq!(session.token().as_deref(), Some("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(refresh.epoch(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_false() {
        let calls = Arc::new(AtomicUsize::new(0));
        let session = SessionContext::in_memory();
        session.set_token("stale").unwrap();
        let refresh = SilentRefresh::new(counting_refresher(calls, Err(())), session.clone());

        assert!(!refresh.refresh().await);
        assert_eq!(session.token().as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn test_sequential_refreshes_each_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresh = SilentRefresh::new(
            counting_refresher(calls.clone(), Ok("fresh")),
            SessionContext::in_memory(),
        );

        assert!(refresh.refresh().await);
        assert!(refresh.refresh().await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_coalesced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresh = Arc::new(SilentRefresh::new(
            counting_refresher(calls.clone(), Ok("fresh")),
            SessionContext::in_memory(),
        ));

        let epoch = refresh.epoch();
        let (a, b, c) = tokio::join!(
            refresh.refresh_since(epoch),
            refresh.refresh_since(epoch),
            refresh.refresh_since(epoch),
        );

        assert_eq!(a.as_deref(), Some("fresh"));
        assert_eq!(b.as_deref(), Some("fresh"));
        assert_eq!(c.as_deref(), Some("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failure_is_shared() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresh = SilentRefresh::new(
            counting_refresher(calls.clone(), Err(())),
            SessionContext::in_memory(),
        );

        let epoch = refresh.epoch();
        let (a, b) = tokio::join!(refresh.refresh_since(epoch), refresh.refresh_since(epoch));

        assert!(a.is_none());
        assert!(b.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_refresher_forces_new_token() {
        let stub = Arc::new(StubIdentityProvider::signed_in("old"));
        stub.set_next_token("new");
        let refresher = ProviderRefresher::new(stub.clone());

        assert_eq!(refresher.refresh_token().await.unwrap(), "new");
        assert_eq!(stub.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_provider_refresher_without_user() {
        let refresher = ProviderRefresher::new(Arc::new(StubIdentityProvider::signed_out()));
        assert!(matches!(
            refresher.refresh_token().await,
            Err(RefreshError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_no_refresher_always_fails() {
        let refresh = SilentRefresh::new(Arc::new(NoRefresher), SessionContext::in_memory());
        assert!(!refresh.refresh().await);
    }
}
