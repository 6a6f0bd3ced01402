//! Live deployment logs and status.
//!
//! A running deployment reports over two independent channels: the
//! server-sent-events [`PushStream`] and the shared realtime connection. The
//! [`DeploymentReconciler`] merges them into one deduplicated log and one
//! canonical status, and falls back to the [`DeploymentStore`] for the
//! authoritative answer.

pub mod dedup;
pub mod reconciler;
pub mod store;
pub mod stream;
pub mod types;

pub use dedup::DedupWindow;
pub use reconciler::{DeploymentReconciler, DeploymentStreamState, ReconcilerOptions, ReconcilerUpdate};
pub use store::{DeploymentStore, HttpDeploymentStore};
pub use stream::{PushEvent, PushStream};
pub use types::{DeploymentRecord, DeploymentStatus, LogEntry, Severity, Source};
