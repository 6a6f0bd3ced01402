//! Single-flight credential refresh.
//!
//! Every caller that hit a 401 calls [`RefreshCoordinator::renew`]. The first
//! one flips `in_flight` and spawns the refresh task; everyone (the first
//! caller included) waits on a oneshot in the queue. The task settles the
//! whole queue at once, so the in-flight flag cannot be stranded by a caller
//! whose future is dropped mid-refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use super::error::truncate_body;
use super::{AuthError, TokenPair, TokenStore};

/// Request timeout for the refresh call itself.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// Capacity of the auth event broadcast channel.
const AUTH_EVENT_CAPACITY: usize = 16;

/// Exchanges a refresh token for a new pair.
///
/// Implementations must not route through [`super::ApiClient`]; the refresh
/// call bypasses the 401 interceptor.
#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    /// Perform one refresh call.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError>;
}

/// Refresher that calls `POST {server}/api/auth/refresh`.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    http: reqwest::Client,
    url: String,
}

impl HttpTokenRefresher {
    /// Create a refresher for the given server base URL.
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            url: format!("{}/api/auth/refresh", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let response = self
            .http
            .post(&self.url)
            .timeout(REFRESH_TIMEOUT)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let pair: TokenPair = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        if pair.access_token.is_empty() || pair.refresh_token.is_empty() {
            return Err(AuthError::InvalidResponse("empty token in refresh response".into()));
        }
        Ok(pair)
    }
}

/// Process-wide authentication events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Credential refresh failed; credentials have been cleared.
    ForcedLogout {
        /// Why the session ended.
        reason: String,
    },
}

type LoginRedirect = Arc<dyn Fn(&AuthError) + Send + Sync>;
type Waiter = oneshot::Sender<Result<String, AuthError>>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    queue: Vec<Waiter>,
}

struct Inner {
    state: Mutex<RefreshState>,
    tokens: TokenStore,
    refresher: Arc<dyn TokenRefresher>,
    events: broadcast::Sender<AuthEvent>,
    login_redirect: Mutex<LoginRedirect>,
    refresh_calls: AtomicU64,
}

/// Guarantees at most one credential refresh in flight.
///
/// Cheap to clone; clones share the same in-flight state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &state.in_flight)
            .field("queued", &state.queue.len())
            .field("refresh_calls", &self.refresh_calls())
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    /// Create a coordinator over a token store and refresher.
    pub fn new(tokens: TokenStore, refresher: Arc<dyn TokenRefresher>) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        let login_redirect: LoginRedirect = Arc::new(|err: &AuthError| {
            log::error!("[Refresh] Session ended ({err}); log in again with `opsdeck login`");
        });
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RefreshState::default()),
                tokens,
                refresher,
                events,
                login_redirect: Mutex::new(login_redirect),
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to auth events (forced logout).
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// Replace the fallback run when a forced logout has no subscriber.
    pub fn set_login_redirect(&self, redirect: impl Fn(&AuthError) + Send + Sync + 'static) {
        *self
            .inner
            .login_redirect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(redirect);
    }

    /// Whether a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_state().in_flight
    }

    /// Number of refresh calls issued so far.
    pub fn refresh_calls(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    /// Obtain a fresh access token after `failed_token` was rejected.
    ///
    /// Joins the in-flight refresh if there is one. If the stored token has
    /// already moved past `failed_token`, returns it without refreshing; if
    /// the store was cleared by a failed refresh, fails without another one.
    pub async fn renew(&self, failed_token: Option<&str>) -> Result<String, AuthError> {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut state = self.inner.lock_state();
            if !state.in_flight {
                match self.inner.tokens.access_token() {
                    Some(current) if failed_token != Some(current.as_str()) => {
                        log::debug!("[Refresh] Credential already renewed, replaying");
                        return Ok(current);
                    }
                    // A refresh already failed and signed the user out.
                    None if failed_token.is_some() => {
                        log::debug!("[Refresh] Already signed out, not refreshing");
                        return Err(AuthError::MissingRefreshToken);
                    }
                    _ => {}
                }
            }
            state.queue.push(tx);
            let start = !state.in_flight;
            state.in_flight = true;
            start
        };

        if start {
            tokio::spawn(Arc::clone(&self.inner).run_refresh());
        } else {
            log::debug!("[Refresh] Refresh in flight, queued");
        }

        rx.await.map_err(|_| AuthError::Aborted)?
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_refresh(self: Arc<Self>) {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        log::info!("[Refresh] Access token expired, refreshing");

        let outcome = match self.tokens.refresh_token() {
            Some(refresh_token) => self.refresher.refresh(&refresh_token).await,
            None => Err(AuthError::MissingRefreshToken),
        };

        // Settle the store before a new refresh can start.
        match &outcome {
            Ok(pair) => self.tokens.rotate(pair.clone()),
            Err(_) => self.tokens.clear(),
        }

        let queue = {
            let mut state = self.lock_state();
            state.in_flight = false;
            std::mem::take(&mut state.queue)
        };

        match outcome {
            Ok(pair) => {
                log::info!("[Refresh] Refreshed, resuming {} queued request(s)", queue.len());
                for waiter in queue {
                    let _ = waiter.send(Ok(pair.access_token.clone()));
                }
            }
            Err(err) => {
                log::warn!("[Refresh] Refresh failed, rejecting {} request(s): {err}", queue.len());
                for waiter in queue {
                    let _ = waiter.send(Err(err.clone()));
                }
                self.force_logout(&err);
            }
        }
    }

    fn force_logout(&self, err: &AuthError) {
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(AuthEvent::ForcedLogout {
                reason: err.to_string(),
            });
        } else {
            let redirect = Arc::clone(
                &self
                    .login_redirect
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            redirect(err);
        }
    }
}
