//! Auth Session
//!
//! Owns the token pair and its lifecycle. The gateway and the streaming layer
//! only ever read the access token through this type; every mutation happens
//! here under one lock.
//!
//! ## Single-flight refresh
//!
//! A refresh is started by the first caller and runs in its own task, so a
//! caller that gives up does not abandon the other waiters. Everyone who asks
//! while it is in flight subscribes to the same broadcast channel and gets
//! the same result:
//!
//! ```text
//! refresh() ─┐
//! refresh() ─┼─> in_flight: broadcast::Sender ──> exchange.refresh() (once)
//! refresh() ─┘          │
//!                       └── finish_refresh() sends Ok(pair) | Err(RefreshFailed)
//! ```
//!
//! Each login, logout or expiry bumps an epoch. A refresh whose epoch is stale
//! when it completes is discarded, so a late response can never resurrect a
//! logged-out session.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::exchange::AuthExchange;
use super::token::{Credentials, TokenPair, TokenResponse, UserProfile};
use crate::credentials::CredentialStore;
use crate::error::AuthError;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Refreshing,
}

/// Notifications for code that reacts to the session changing underneath it,
/// e.g. a UI redirecting to its login screen on `Expired`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    Refreshed,
    /// The session ended because the server stopped accepting it. Emitted
    /// once per episode.
    Expired,
    LoggedOut,
}

type RefreshResult = Result<TokenPair, AuthError>;

struct SessionState {
    state: AuthState,
    tokens: Option<TokenPair>,
    user: Option<UserProfile>,
    in_flight: Option<broadcast::Sender<RefreshResult>>,
    epoch: u64,
}

struct Inner {
    exchange: Arc<dyn AuthExchange>,
    store: Arc<dyn CredentialStore>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Shared handle to the auth session. Cloning is cheap and every clone sees
/// the same state.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<Inner>,
}

impl AuthSession {
    pub fn new(exchange: Arc<dyn AuthExchange>, store: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                exchange,
                store,
                state: Mutex::new(SessionState {
                    state: AuthState::Unauthenticated,
                    tokens: None,
                    user: None,
                    in_flight: None,
                    epoch: 0,
                }),
                events,
            }),
        }
    }

    /// Exchange credentials for a token pair and install it.
    pub async fn login(&self, credentials: &Credentials) -> Result<TokenPair, AuthError> {
        let mut response = self.inner.exchange.login(credentials).await?;
        let user = response.user.take();
        let pair = response
            .into_pair(None, Utc::now())
            .ok_or_else(|| AuthError::Network("login response carried no tokens".into()))?;

        {
            let mut st = self.inner.lock();
            st.epoch += 1;
            st.tokens = Some(pair.clone());
            st.user = user;
            st.state = AuthState::Authenticated;
            self.inner.store.set(&pair);
            // Anyone still waiting on an old refresh can use the fresh login.
            if let Some(waiters) = st.in_flight.take() {
                let _ = waiters.send(Ok(pair.clone()));
            }
        }

        info!(username = %credentials.username, "Logged in");
        self.inner.emit(SessionEvent::LoggedIn);
        Ok(pair)
    }

    /// Non-blocking read of the in-memory access token. It may already have
    /// been revoked server-side.
    pub fn current_access_token(&self) -> Option<String> {
        self.inner.lock().tokens.as_ref().map(|t| t.access.clone())
    }

    pub fn state(&self) -> AuthState {
        self.inner.lock().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() != AuthState::Unauthenticated
    }

    /// User returned alongside the last login, if the server sent one.
    pub fn user(&self) -> Option<UserProfile> {
        self.inner.lock().user.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Refresh the token pair. Concurrent callers share one exchange.
    pub async fn refresh(&self) -> Result<TokenPair, AuthError> {
        self.refresh_from(None).await
    }

    /// Refresh because `rejected` was turned down by the server. If the
    /// session already holds a different token, someone else has refreshed
    /// since the rejected request was sent and that token is returned as is.
    pub async fn refresh_from(&self, rejected: Option<&str>) -> Result<TokenPair, AuthError> {
        let mut waiter = {
            let mut st = self.inner.lock();

            if let (Some(rejected), Some(tokens)) = (rejected, st.tokens.as_ref()) {
                if st.state == AuthState::Authenticated && tokens.access != rejected {
                    debug!("Rejected token already superseded, skipping refresh");
                    return Ok(tokens.clone());
                }
            }

            match st.in_flight.as_ref() {
                Some(sender) => sender.subscribe(),
                None => {
                    let refresh_token = match st.tokens.as_ref() {
                        Some(tokens) => tokens.refresh.clone(),
                        None => {
                            return Err(AuthError::RefreshFailed("no refresh token".into()));
                        }
                    };
                    let (sender, receiver) = broadcast::channel(1);
                    st.in_flight = Some(sender);
                    st.state = AuthState::Refreshing;
                    let epoch = st.epoch;
                    debug!(epoch, "Starting token refresh");

                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        let result = inner.exchange.refresh(&refresh_token).await;
                        inner.finish_refresh(epoch, result);
                    });
                    receiver
                }
            }
        };

        match waiter.recv().await {
            Ok(result) => result,
            Err(_) => Err(AuthError::RefreshFailed("refresh abandoned".into())),
        }
    }

    /// Load the durable pair and assume it is valid until a request says
    /// otherwise.
    pub fn restore(&self) -> bool {
        let Some(tokens) = self.inner.store.get() else {
            return false;
        };
        if tokens.is_expired_at(Utc::now()) {
            debug!("Restored access token is past its expiry, keeping it for refresh");
        }

        let mut st = self.inner.lock();
        st.tokens = Some(tokens);
        st.state = AuthState::Authenticated;
        info!("Session restored from credential store");
        true
    }

    /// End the session because the server rejected it even after a refresh.
    /// Fires `SessionEvent::Expired` at most once per episode.
    pub fn expire(&self) {
        {
            let mut st = self.inner.lock();
            if st.state == AuthState::Unauthenticated {
                return;
            }
            st.epoch += 1;
            st.tokens = None;
            st.user = None;
            st.state = AuthState::Unauthenticated;
            self.inner.store.clear();
            if let Some(waiters) = st.in_flight.take() {
                let _ = waiters.send(Err(AuthError::RefreshFailed("session expired".into())));
            }
        }
        warn!("Session expired");
        self.inner.emit(SessionEvent::Expired);
    }

    /// Clear local and durable tokens, cancel refresh waiters, then tell the
    /// server. Idempotent.
    pub async fn logout(&self) {
        let discarded = {
            let mut st = self.inner.lock();
            let was_active = st.state != AuthState::Unauthenticated || st.tokens.is_some();
            st.epoch += 1;
            st.state = AuthState::Unauthenticated;
            st.user = None;
            self.inner.store.clear();
            if let Some(waiters) = st.in_flight.take() {
                let _ = waiters.send(Err(AuthError::LoggedOut));
            }
            let tokens = st.tokens.take();
            if !was_active {
                return;
            }
            tokens
        };

        info!("Logged out");
        self.inner.emit(SessionEvent::LoggedOut);

        if let Some(tokens) = discarded {
            if let Err(e) = self.inner.exchange.logout(&tokens.access).await {
                debug!(error = %e, "Server-side logout failed");
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn finish_refresh(&self, epoch: u64, result: Result<TokenResponse, AuthError>) {
        let expired = {
            let mut st = self.lock();
            if st.epoch != epoch {
                debug!(epoch, current = st.epoch, "Discarding refresh result from an ended session");
                return;
            }
            let Some(waiters) = st.in_flight.take() else {
                return;
            };

            let previous = st.tokens.as_ref().map(|t| t.refresh.clone());
            let outcome = match result {
                Ok(response) => response
                    .into_pair(previous.as_deref(), Utc::now())
                    .ok_or_else(|| AuthError::RefreshFailed("refresh response carried no tokens".into())),
                Err(AuthError::RefreshFailed(reason)) => Err(AuthError::RefreshFailed(reason)),
                Err(other) => Err(AuthError::RefreshFailed(other.to_string())),
            };

            let expired = match &outcome {
                Ok(pair) => {
                    st.tokens = Some(pair.clone());
                    st.state = AuthState::Authenticated;
                    self.store.set(pair);
                    false
                }
                Err(e) => {
                    error!(error = %e, "Token refresh failed, clearing session");
                    st.epoch += 1;
                    st.tokens = None;
                    st.user = None;
                    st.state = AuthState::Unauthenticated;
                    self.store.clear();
                    true
                }
            };
            let _ = waiters.send(outcome);
            expired
        };

        if expired {
            self.emit(SessionEvent::Expired);
        } else {
            info!("Access token refreshed");
            self.emit(SessionEvent::Refreshed);
        }
    }
}
