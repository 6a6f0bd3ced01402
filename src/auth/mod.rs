//! Authenticated HTTP access with single-flight credential refresh.
//!
//! # Architecture
//!
//! ```text
//!   caller ──► ApiClient::send ──► 2xx/4xx/5xx ──► caller
//!                   │
//!                   │ 401 (not an auth endpoint, first attempt)
//!                   ▼
//!            RefreshCoordinator::renew ──► queue ◄── other 401 callers
//!                   │
//!                   │ exactly one TokenRefresher::refresh at a time
//!                   ▼
//!      Ok(pair)  → TokenStore::rotate, every waiter replays once
//!      Err(e)    → TokenStore::clear, every waiter fails with e,
//!                  one AuthEvent::ForcedLogout (or login redirect)
//! ```
//!
//! No other component may call the refresh endpoint; they all go through
//! [`ApiClient`] or [`RefreshCoordinator::renew`].

mod client;
mod error;
mod refresh;
mod tokens;

pub(crate) use client::ensure_success;
pub use client::{ApiClient, ApiRequest, TokenPlacement, AUTH_ENDPOINTS};
pub use error::{ApiError, AuthError};
pub use refresh::{AuthEvent, HttpTokenRefresher, RefreshCoordinator, TokenRefresher};
pub use tokens::{TokenPair, TokenStore};
