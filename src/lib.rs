//! Opsdeck - live operation stream core.
//!
//! Client-side core of the opsdeck server dashboard: keeps a deployment's
//! logs/status and any number of remote shell sessions consistent across
//! dropped connections, duplicate delivery over two transports and
//! concurrent sessions sharing one connection.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!                  │ auth: ApiClient              │  401 → RefreshCoordinator
//!                  │       (single-flight refresh)│        (one refresh at a time)
//!                  └──────────────┬───────────────┘
//!                                 │
//!   ┌─────────────────────────────┼──────────────────────────────┐
//!   │                             │                              │
//!   ▼                             ▼                              ▼
//! deployment::PushStream   connection::ConnectionManager   deployment::HttpDeploymentStore
//!   (SSE)                    (one shared socket)           processes::ProcessSource
//!   │                             │
//!   │             ┌───────────────┼──────────────────┐
//!   ▼             ▼               ▼                  ▼
//! deployment::DeploymentReconciler  terminal::TerminalMultiplexer  processes::ProcessWatcher
//! ```
//!
//! # Modules
//!
//! - [`auth`] - Token storage, authenticated HTTP and credential refresh
//! - [`connection`] - The shared realtime connection
//! - [`terminal`] - Multiplexed remote shell sessions
//! - [`deployment`] - Dual-channel deployment log/status reconciliation
//! - [`processes`] - Live process listing
//! - [`config`] - Configuration loading/saving

pub mod auth;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod deployment;
pub mod env;
pub mod processes;
pub mod terminal;
pub mod wire;

// Re-export commonly used types
pub use auth::{ApiClient, AuthEvent, RefreshCoordinator, TokenPair, TokenStore};
pub use config::Config;
pub use connection::{Connection, ConnectionManager, ConnectionState};
pub use deployment::{DeploymentReconciler, ReconcilerUpdate};
pub use processes::ProcessWatcher;
pub use terminal::TerminalMultiplexer;
