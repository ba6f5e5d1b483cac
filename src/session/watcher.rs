//! Token expiry watcher, mounted once at the application root.
//!
//! Follows the identity provider's change notifications. Whenever a new
//! token is issued it is persisted and a single deadline is armed at
//! `expiry - margin`; reaching the deadline forces the user back to sign-in.
//! There is exactly one deadline slot, so arming always replaces the
//! previous deadline. Once the session has been ended the watcher ignores
//! token changes until the provider reports a signed-in user again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::events::{AuthEvents, AuthSignal, SignOutReason};
use crate::auth::provider::{IdentityChange, IdentityProvider};
use crate::auth::token;
use crate::session::SessionContext;

/// Lifecycle of a mounted watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// No user, or the session has been ended.
    Idle,
    /// A user is signed in and an expiry deadline is armed.
    Watching,
}

/// Handle to a mounted watcher. Dropping it unmounts the watcher.
pub struct ExpiryWatcher {
    state: watch::Receiver<WatcherState>,
    task: JoinHandle<()>,
}

impl ExpiryWatcher {
    /// Start following `provider`.
    ///
    /// If a user is already signed in, the current token is armed
    /// immediately.
    pub fn mount(
        provider: Arc<dyn IdentityProvider>,
        session: SessionContext,
        events: AuthEvents,
        margin_ms: i64,
    ) -> Self {
        let (state_tx, state) = watch::channel(WatcherState::Idle);
        let changes = provider.subscribe();
        let worker = Worker {
            provider,
            session,
            events,
            margin_ms,
            state: state_tx,
            deadline: None,
            ended: false,
        };
        let task = tokio::spawn(worker.run(changes));

        Self { state, task }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WatcherState> {
        self.state.clone()
    }

    /// Stop watching. Any armed deadline is discarded.
    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for ExpiryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Worker {
    provider: Arc<dyn IdentityProvider>,
    session: SessionContext,
    events: AuthEvents,
    margin_ms: i64,
    state: watch::Sender<WatcherState>,
    deadline: Option<Instant>,
    /// Set once sign-in has been forced; cleared by the next signed-in user.
    ended: bool,
}

impl Worker {
    async fn run(mut self, mut changes: broadcast::Receiver<IdentityChange>) {
        if self.provider.current_user().is_some() {
            self.rearm().await;
        }

        loop {
            tokio::select! {
                _ = sleep_until(self.deadline) => {
                    info!("Session token reached its expiry margin");
                    self.force_sign_in(SignOutReason::Expired);
                }
                change = changes.recv() => match change {
                    Ok(IdentityChange::AuthStateChanged(None)) => {
                        self.force_sign_in(SignOutReason::SignedOut);
                    }
                    Ok(IdentityChange::AuthStateChanged(Some(user))) => {
                        debug!("Auth state changed to {}", user.uid);
                        self.ended = false;
                    }
                    Ok(IdentityChange::TokenChanged(Some(_))) if self.ended => {
                        debug!("Ignoring token change for an ended session");
                    }
                    Ok(IdentityChange::TokenChanged(Some(_))) => {
                        self.rearm().await;
                    }
                    Ok(IdentityChange::TokenChanged(None)) => {
                        self.cancel();
                        self.state.send_replace(WatcherState::Idle);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Expiry watcher missed {} identity changes; resyncing", missed);
                        if self.provider.current_user().is_some() {
                            self.ended = false;
                            self.rearm().await;
                        } else if !self.ended {
                            self.force_sign_in(SignOutReason::SignedOut);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Identity provider closed its change stream");
                        break;
                    }
                },
            }
        }
    }

    /// Fetch the current token, persist it, and arm its deadline.
    async fn rearm(&mut self) {
        self.cancel();

        let token = match self.provider.id_token(false).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Could not fetch session token: {}", e);
                self.force_sign_in(SignOutReason::RefreshFailed);
                return;
            }
        };

        if let Err(e) = self.session.set_token(&token) {
            warn!("Failed to persist session token: {}", e);
        }

        let now = token::now_ms();
        if token::is_expired_at(Some(token.as_str()), self.margin_ms, now) {
            self.force_sign_in(SignOutReason::Expired);
            return;
        }

        let delay = Duration::from_millis(token::millis_until_expiry(&token, self.margin_ms, now));
        self.deadline = Some(Instant::now() + delay);
        self.state.send_replace(WatcherState::Watching);
        debug!("Expiry deadline armed in {:?}", delay);
    }

    fn cancel(&mut self) {
        if self.deadline.take().is_some() {
            debug!("Expiry deadline cancelled");
        }
    }

    fn force_sign_in(&mut self, reason: SignOutReason) {
        self.cancel();
        self.ended = true;
        self.state.send_replace(WatcherState::Idle);
        self.events.emit(AuthSignal::SignInRequired { reason });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::stub::StubIdentityProvider;
    use crate::auth::provider::{AuthState, AuthUser};
    use crate::auth::rest_provider::{RestIdentityConfig, RestIdentityProvider};
    use crate::testing::{MockBackend, PASSWORD};
    use crate::auth::token::{DEFAULT_EXPIRY_MARGIN_MS, mint_token, now_ms};
    use tokio::time::timeout;

    fn token_expiring_in(secs: i64) -> String {
        mint_token(now_ms() / 1000 + secs)
    }

    fn user() -> Option<AuthUser> {
        Some(AuthUser::new("user-1", None))
    }

    struct Mounted {
        stub: Arc<StubIdentityProvider>,
        session: SessionContext,
        signals: broadcast::Receiver<AuthSignal>,
        watcher: ExpiryWatcher,
    }

    fn mount(stub: StubIdentityProvider) -> Mounted {
        let stub = Arc::new(stub);
        let session = SessionContext::in_memory();
        let events = AuthEvents::new();
        let signals = events.subscribe();
        let watcher = ExpiryWatcher::mount(
            stub.clone(),
            session.clone(),
            events,
            DEFAULT_EXPIRY_MARGIN_MS,
        );
        Mounted {
            stub,
            session,
            signals,
            watcher,
        }
    }

    async fn wait_for_state(watcher: &ExpiryWatcher, expected: WatcherState) {
        let mut rx = watcher.watch_state();
        timeout(Duration::from_secs(1), rx.wait_for(|s| *s == expected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_deadline() {
        let mut m = mount(StubIdentityProvider::signed_in(&token_expiring_in(60)));
        wait_for_state(&m.watcher, WatcherState::Watching).await;

        let start = Instant::now();
        let second = token_expiring_in(30);
        m.stub.set_token(&second);
        m.stub.emit(IdentityChange::TokenChanged(user()));

        let signal = timeout(Duration::from_secs(120), m.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            signal,
            AuthSignal::SignInRequired {
                reason: SignOutReason::Expired
            }
        );

        // Fired on the second token's deadline (about 25s), not the first (55s).
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20), "fired too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(30), "fired too late: {elapsed:?}");
        assert_eq!(m.session.token(), Some(second));
        assert_eq!(m.watcher.state(), WatcherState::Idle);

        // The first deadline was discarded and never fires.
        assert!(timeout(Duration::from_secs(120), m.signals.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_token_postpones_deadline() {
        let mut m = mount(StubIdentityProvider::signed_in(&token_expiring_in(20)));
        wait_for_state(&m.watcher, WatcherState::Watching).await;

        let start = Instant::now();
        m.stub.set_token(&token_expiring_in(300));
        m.stub.emit(IdentityChange::TokenChanged(user()));

        let signal = timeout(Duration::from_secs(600), m.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason(), &SignOutReason::Expired);
        assert!(start.elapsed() >= Duration::from_secs(290));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_cancels_deadline() {
        let mut m = mount(StubIdentityProvider::signed_in(&token_expiring_in(60)));
        wait_for_state(&m.watcher, WatcherState::Watching).await;

        m.stub.set_state(AuthState::SignedOut);
        m.stub.emit(IdentityChange::AuthStateChanged(None));

        let signal = timeout(Duration::from_secs(1), m.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            signal,
            AuthSignal::SignInRequired {
                reason: SignOutReason::SignedOut
            }
        );
        assert_eq!(m.watcher.state(), WatcherState::Idle);

        assert!(timeout(Duration::from_secs(120), m.signals.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_forces_sign_in_immediately() {
        let mut m = mount(StubIdentityProvider::signed_in(&token_expiring_in(3)));

        let signal = timeout(Duration::from_secs(1), m.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason(), &SignOutReason::Expired);
        assert_eq!(m.watcher.state(), WatcherState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_fetch_failure_forces_refresh_failed() {
        let mut m = mount(StubIdentityProvider::signed_in(&token_expiring_in(60)));
        wait_for_state(&m.watcher, WatcherState::Watching).await;

        m.stub.set_failing(true);
        m.stub.emit(IdentityChange::TokenChanged(user()));

        let signal = timeout(Duration::from_secs(1), m.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason(), &SignOutReason::RefreshFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_without_user() {
        let mut m = mount(StubIdentityProvider::signed_out());
        tokio::task::yield_now().await;

        assert_eq!(m.watcher.state(), WatcherState::Idle);
        assert!(timeout(Duration::from_secs(60), m.signals.recv()).await.is_err());
        assert_eq!(m.session.token(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_removed_goes_idle() {
        let mut m = mount(StubIdentityProvider::signed_in(&token_expiring_in(60)));
        wait_for_state(&m.watcher, WatcherState::Watching).await;

        m.stub.emit(IdentityChange::TokenChanged(None));
        wait_for_state(&m.watcher, WatcherState::Idle).await;

        assert!(timeout(Duration::from_secs(120), m.signals.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_that_is_already_expired_fires_once() {
        let stub = StubIdentityProvider::signed_in(&token_expiring_in(-10));
        stub.set_renew_on_read(true);
        let mut m = mount(stub);

        let signal = timeout(Duration::from_secs(1), m.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason(), &SignOutReason::Expired);

        // The renewal's own TokenChanged must not start another round.
        assert!(timeout(Duration::from_secs(60), m.signals.recv()).await.is_err());
        assert_eq!(m.stub.refresh_count(), 1);
        assert_eq!(m.watcher.state(), WatcherState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_sign_in_resumes_after_session_end() {
        let mut m = mount(StubIdentityProvider::signed_in(&token_expiring_in(3)));
        let signal = timeout(Duration::from_secs(1), m.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason(), &SignOutReason::Expired);

        m.stub.set_token(&token_expiring_in(60));
        m.stub.emit(IdentityChange::TokenChanged(user()));
        tokio::task::yield_now().await;
        assert_eq!(m.watcher.state(), WatcherState::Idle);

        m.stub.emit(IdentityChange::AuthStateChanged(user()));
        m.stub.emit(IdentityChange::TokenChanged(user()));
        wait_for_state(&m.watcher, WatcherState::Watching).await;
    }

    #[tokio::test]
    async fn test_margin_longer_than_token_lifetime_does_not_storm() {
        let backend = MockBackend::spawn().await;
        let origin = backend.origin();
        let provider = Arc::new(RestIdentityProvider::new(
            reqwest::Client::new(),
            RestIdentityConfig {
                identity_url: origin.clone(),
                securetoken_url: origin,
                ..Default::default()
            },
        ));
        provider
            .sign_in_with_password("hr@acme.test", PASSWORD)
            .await
            .unwrap();

        let events = AuthEvents::new();
        let mut signals = events.subscribe();
        // Mock tokens live an hour; a two hour margin puts every token inside it.
        let watcher = ExpiryWatcher::mount(
            provider,
            SessionContext::in_memory(),
            events,
            2 * 3600 * 1000,
        );

        let signal = timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.reason(), &SignOutReason::Expired);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(backend.identity_refreshes() <= 1, "refreshes: {}", backend.identity_refreshes());
        assert!(matches!(
            signals.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(watcher.state(), WatcherState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_discards_deadline() {
        let m = mount(StubIdentityProvider::signed_in(&token_expiring_in(30)));
        wait_for_state(&m.watcher, WatcherState::Watching).await;

        let mut signals = m.signals;
        m.watcher.unmount();

        assert!(matches!(
            timeout(Duration::from_secs(120), signals.recv()).await,
            Err(_) | Ok(Err(broadcast::error::RecvError::Closed))
        ));
    }
}
