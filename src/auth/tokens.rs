//! Shared in-memory credential store, optionally persisted.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;

/// Access/refresh credential pair as returned by login and refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    /// Short-lived bearer token.
    pub access_token: String,
    /// Long-lived token used only against the refresh endpoint.
    pub refresh_token: String,
}

impl TokenPair {
    /// Create a pair.
    pub fn new(access_token: String, refresh_token: String) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct TokenState {
    pair: Option<TokenPair>,
    /// Bumped on login and logout, not on refresh.
    identity_epoch: u64,
}

/// Process-wide credential holder shared by every client component.
///
/// Cloning is cheap; all clones observe the same state. A persistent store
/// mirrors every change into [`Credentials`].
#[derive(Debug, Clone)]
pub struct TokenStore {
    state: Arc<RwLock<TokenState>>,
    persist: bool,
}

impl TokenStore {
    /// Store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(TokenState::default())),
            persist: false,
        }
    }

    /// In-memory store seeded with a pair.
    pub fn with_pair(pair: TokenPair) -> Self {
        let store = Self::in_memory();
        store.write_state(|state| state.pair = Some(pair));
        store
    }

    /// Store backed by the keyring (or credentials file in tests).
    pub fn persistent() -> anyhow::Result<Self> {
        let pair = Credentials::load()?.token_pair();
        Ok(Self {
            state: Arc::new(RwLock::new(TokenState {
                pair,
                identity_epoch: 0,
            })),
            persist: true,
        })
    }

    /// Current access token.
    pub fn access_token(&self) -> Option<String> {
        self.read_state(|state| state.pair.as_ref().map(|p| p.access_token.clone()))
    }

    /// Current refresh token.
    pub fn refresh_token(&self) -> Option<String> {
        self.read_state(|state| state.pair.as_ref().map(|p| p.refresh_token.clone()))
    }

    /// Current pair.
    pub fn pair(&self) -> Option<TokenPair> {
        self.read_state(|state| state.pair.clone())
    }

    /// Whether any credentials are stored.
    pub fn is_authenticated(&self) -> bool {
        self.read_state(|state| state.pair.is_some())
    }

    /// Counter that changes whenever the logged-in identity changes.
    ///
    /// Connections created under an older epoch must be recreated.
    pub fn identity_epoch(&self) -> u64 {
        self.read_state(|state| state.identity_epoch)
    }

    /// Install credentials for a new login.
    pub fn login(&self, pair: TokenPair) {
        self.write_state(|state| {
            state.pair = Some(pair);
            state.identity_epoch += 1;
        });
        self.persist();
    }

    /// Replace the pair after a refresh; the identity is unchanged.
    pub fn rotate(&self, pair: TokenPair) {
        self.write_state(|state| state.pair = Some(pair));
        self.persist();
    }

    /// Drop all credentials.
    pub fn clear(&self) {
        self.write_state(|state| {
            state.pair = None;
            state.identity_epoch += 1;
        });
        if self.persist {
            if let Err(e) = Credentials::delete() {
                log::warn!("Failed to delete stored credentials: {e:#}");
            }
        }
    }

    fn persist(&self) {
        if !self.persist {
            return;
        }
        let creds = self
            .pair()
            .map_or_else(Credentials::default, |pair| Credentials::from_pair(&pair));
        if let Err(e) = creds.save() {
            log::warn!("Failed to persist credentials: {e:#}");
        }
    }

    fn read_state<T>(&self, f: impl FnOnce(&TokenState) -> T) -> T {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write_state(&self, f: impl FnOnce(&mut TokenState)) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }
}
