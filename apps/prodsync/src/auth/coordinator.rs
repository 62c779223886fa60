use crate::auth::credentials::{CredentialStore, StoredSession, UserProfile};
use crate::auth::error::AuthError;
use crate::auth::gateway::{AuthGateway, RegisterRequest, TokenResponse};
use crate::auth::prompt::{SessionDecision, SessionPrompt};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shared handle to the single in-flight refresh. Resolves to the new access
/// token, or `None` once the session has been dropped.
pub type RefreshFuture = Shared<BoxFuture<'static, Option<String>>>;

/// Point-in-time view of the session for display and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub refresh_pending: bool,
    pub awaiting_user_decision: bool,
}

/// Owns the access/refresh token pair and the user-gated renewal protocol.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    gateway: AuthGateway,
    store: Arc<dyn CredentialStore>,
    prompt: Arc<dyn SessionPrompt>,
    session: RwLock<StoredSession>,
    in_flight: Mutex<Option<RefreshFuture>>,
    awaiting_decision: watch::Sender<bool>,
    refreshes: AtomicU64,
}

impl SessionCoordinator {
    /// Restores persisted credentials, if any.
    pub fn open(
        gateway: AuthGateway,
        store: Arc<dyn CredentialStore>,
        prompt: Arc<dyn SessionPrompt>,
    ) -> Result<Self, AuthError> {
        let session = store.load()?;
        if session.access_token.is_some() {
            debug!(target: "prodsync::auth", "restored persisted session");
        }
        let (awaiting_decision, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                gateway,
                store,
                prompt,
                session: RwLock::new(session),
                in_flight: Mutex::new(None),
                awaiting_decision,
                refreshes: AtomicU64::new(0),
            }),
        })
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.session.read().access_token.clone()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.inner.session.read().user.clone()
    }

    pub fn user_email(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .user
            .as_ref()
            .map(|user| user.email.clone())
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.session.read().access_token.is_some()
    }

    pub fn state(&self) -> SessionState {
        let session = self.inner.session.read();
        SessionState {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            refresh_pending: self.refresh_in_flight(),
            awaiting_user_decision: *self.inner.awaiting_decision.borrow(),
        }
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    pub fn awaiting_decision(&self) -> watch::Receiver<bool> {
        self.inner.awaiting_decision.subscribe()
    }

    /// Number of refresh cycles started since the coordinator was opened.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }

    /// Starts a refresh, or joins the one already running.
    ///
    /// The refresh is driven on its own task, so it completes even if every
    /// caller stops waiting.
    pub fn refresh(&self) -> RefreshFuture {
        let mut slot = self.inner.in_flight.lock();
        if let Some(pending) = slot.as_ref() {
            debug!(target: "prodsync::auth", "joining in-flight session refresh");
            return pending.clone();
        }

        let cycle = self.inner.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        let inner = Arc::clone(&self.inner);
        let future = async move {
            let outcome = inner.run_refresh(cycle).await;
            inner.in_flight.lock().take();
            outcome
        }
        .boxed()
        .shared();
        *slot = Some(future.clone());
        drop(slot);

        tokio::spawn(future.clone());
        future
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, AuthError> {
        let tokens = self.inner.gateway.login(email, password).await?;
        self.adopt_login(tokens).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<UserProfile, AuthError> {
        let tokens = self.inner.gateway.register(request).await?;
        self.adopt_login(tokens).await
    }

    /// Fetches `/auth/me` and caches the profile.
    pub async fn current_user(&self) -> Result<UserProfile, AuthError> {
        let token = self.access_token().ok_or(AuthError::NotLoggedIn)?;
        let user = self.inner.gateway.me(&token).await?;
        let snapshot = {
            let mut session = self.inner.session.write();
            session.user = Some(user.clone());
            session.updated_at = Some(Utc::now());
            session.clone()
        };
        self.inner.store.save(&snapshot)?;
        Ok(user)
    }

    pub fn logout(&self) -> Result<(), AuthError> {
        info!(target: "prodsync::auth", "logging out");
        *self.inner.session.write() = StoredSession::default();
        self.inner.store.clear()
    }

    async fn adopt_login(&self, tokens: TokenResponse) -> Result<UserProfile, AuthError> {
        let known_user = tokens.user.clone();
        self.inner.install_tokens(tokens)?;
        match known_user {
            Some(user) => Ok(user),
            None => self.current_user().await,
        }
    }
}

impl Inner {
    async fn run_refresh(&self, cycle: u64) -> Option<String> {
        self.awaiting_decision.send_replace(true);
        info!(target: "prodsync::auth", cycle, "session expiring; waiting for operator decision");
        let decision = self.prompt.decide().await;
        self.awaiting_decision.send_replace(false);

        match decision {
            SessionDecision::LogOut => {
                info!(target: "prodsync::auth", cycle, "operator chose to log out");
                self.clear_credentials();
                None
            }
            SessionDecision::Extend => {
                let refresh_token = self.session.read().refresh_token.clone();
                let Some(refresh_token) = refresh_token else {
                    warn!(target: "prodsync::auth", cycle, "no refresh token stored; dropping session");
                    self.clear_credentials();
                    return None;
                };
                match self.gateway.refresh(&refresh_token).await {
                    Ok(tokens) => {
                        let access = tokens.access_token.clone();
                        if let Err(err) = self.install_tokens(tokens) {
                            warn!(
                                target: "prodsync::auth",
                                error = %err,
                                "refreshed tokens could not be persisted; keeping them in memory"
                            );
                        }
                        info!(target: "prodsync::auth", cycle, "session extended");
                        Some(access)
                    }
                    Err(err) => {
                        warn!(target: "prodsync::auth", cycle, error = %err, "session refresh failed");
                        self.clear_credentials();
                        None
                    }
                }
            }
        }
    }

    /// Memory is updated before the store so a persistence failure never
    /// loses the fresh pair.
    fn install_tokens(&self, tokens: TokenResponse) -> Result<(), AuthError> {
        let snapshot = {
            let mut session = self.session.write();
            session.access_token = Some(tokens.access_token);
            session.refresh_token = Some(tokens.refresh_token);
            if let Some(user) = tokens.user {
                session.user = Some(user);
            }
            session.updated_at = Some(Utc::now());
            session.clone()
        };
        self.store.save(&snapshot)
    }

    fn clear_credentials(&self) {
        *self.session.write() = StoredSession::default();
        if let Err(err) = self.store.clear() {
            warn!(target: "prodsync::auth", error = %err, "failed to clear stored credentials");
        }
    }
}
