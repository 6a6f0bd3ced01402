//! Live process listing for one server.
//!
//! The server pushes `processes:update` snapshots to subscribers over the
//! shared connection. Subscriptions do not survive a reconnect, so the
//! watcher re-subscribes after each one, and it polls the HTTP listing every
//! 30 s in case a push was lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{Interval, MissedTickBehavior};

use crate::auth::{ApiClient, ApiError, ApiRequest};
use crate::connection::{Connection, InboundEvent, ReconnectNotice, Subscription};
use crate::wire::opt_id_string;

/// `processes:subscribe` (client → server).
pub const SUBSCRIBE: &str = "processes:subscribe";
/// `processes:unsubscribe` (client → server).
pub const UNSUBSCRIBE: &str = "processes:unsubscribe";
/// `processes:update` (server → client).
pub const UPDATE: &str = "processes:update";

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One process on a managed server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Process id.
    pub pid: u32,
    /// Process name.
    pub name: String,
    /// Full command line, when reported.
    #[serde(default)]
    pub command: Option<String>,
    /// CPU usage in percent.
    #[serde(default)]
    pub cpu: f64,
    /// Resident memory in bytes.
    #[serde(default)]
    pub memory: u64,
    /// Owning user, when reported.
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    #[serde(default, rename = "serverId", deserialize_with = "opt_id_string")]
    server_id: Option<String>,
    processes: Vec<ProcessInfo>,
}

/// Where a process snapshot can be fetched on demand.
#[async_trait]
pub trait ProcessSource: Send + Sync + std::fmt::Debug {
    /// Current process list of a server.
    async fn list(&self, server_id: &str) -> Result<Vec<ProcessInfo>, ApiError>;
}

#[async_trait]
impl ProcessSource for ApiClient {
    async fn list(&self, server_id: &str) -> Result<Vec<ProcessInfo>, ApiError> {
        self.json(&ApiRequest::get(format!("/api/servers/{server_id}/processes")))
            .await
    }
}

/// Change reported by [`ProcessWatcher::next_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessUpdate {
    /// A snapshot pushed over the connection was applied.
    Pushed,
    /// A snapshot fetched by the fallback poll was applied.
    Polled,
    /// The subscription was renewed after a reconnect.
    Resubscribed,
}

/// Keeps a server's process list current.
///
/// Dropping it unsubscribes (fire-and-forget).
#[derive(Debug)]
pub struct ProcessWatcher {
    server_id: String,
    connection: Arc<dyn Connection>,
    subscription: Subscription,
    reconnects: broadcast::Receiver<ReconnectNotice>,
    source: Arc<dyn ProcessSource>,
    poll: Interval,
    processes: Vec<ProcessInfo>,
}

impl ProcessWatcher {
    /// Subscribe to `server_id`'s process list. The first fallback poll runs
    /// immediately.
    pub fn attach(
        server_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        source: Arc<dyn ProcessSource>,
        poll_interval: Duration,
    ) -> Self {
        let subscription = connection.subscribe(&[UPDATE]);
        let reconnects = connection.reconnects();
        let mut poll = tokio::time::interval(poll_interval.max(MIN_POLL_INTERVAL));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let watcher = Self {
            server_id: server_id.into(),
            connection,
            subscription,
            reconnects,
            source,
            poll,
            processes: Vec::new(),
        };
        watcher.subscribe();
        watcher
    }

    /// Server being watched.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Latest snapshot.
    pub fn processes(&self) -> &[ProcessInfo] {
        &self.processes
    }

    /// Wait for the next change. `None` once the connection is gone.
    pub async fn next_update(&mut self) -> Option<ProcessUpdate> {
        loop {
            tokio::select! {
                event = self.subscription.recv() => {
                    let event = event?;
                    if self.handle_event(&event) {
                        return Some(ProcessUpdate::Pushed);
                    }
                }
                notice = self.reconnects.recv() => match notice {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.handle_reconnect();
                        return Some(ProcessUpdate::Resubscribed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = self.poll.tick() => {
                    if self.poll_now().await {
                        return Some(ProcessUpdate::Polled);
                    }
                }
            }
        }
    }

    /// Apply a `processes:update` event. Returns `true` if it was for this
    /// server and replaced the snapshot.
    pub fn handle_event(&mut self, event: &InboundEvent) -> bool {
        if event.name != UPDATE {
            return false;
        }
        let payload: UpdatePayload = match serde_json::from_value(event.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                log::trace!("[Processes] Dropping malformed update: {e}");
                return false;
            }
        };
        if payload.server_id.as_deref().is_some_and(|id| id != self.server_id) {
            return false;
        }
        self.processes = payload.processes;
        true
    }

    /// Renew the server-side subscription after a reconnect.
    pub fn handle_reconnect(&self) {
        log::debug!("[Processes] Re-subscribing to server {}", self.server_id);
        self.subscribe();
    }

    /// Fetch the list over HTTP now. Returns `true` if the snapshot was
    /// replaced.
    pub async fn poll_now(&mut self) -> bool {
        match self.source.list(&self.server_id).await {
            Ok(processes) => {
                self.processes = processes;
                true
            }
            Err(e) => {
                log::warn!("[Processes] Polling server {} failed: {e}", self.server_id);
                false
            }
        }
    }

    fn subscribe(&self) {
        let payload = serde_json::json!({ "serverId": self.server_id });
        if let Err(e) = self.connection.emit(SUBSCRIBE, payload) {
            log::warn!("[Processes] Failed to subscribe: {e}");
        }
    }
}

impl Drop for ProcessWatcher {
    fn drop(&mut self) {
        let payload = serde_json::json!({ "serverId": self.server_id });
        let _ = self.connection.emit(UNSUBSCRIBE, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryConnection;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProcessSource for CountingSource {
        async fn list(&self, _server_id: &str) -> Result<Vec<ProcessInfo>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ProcessInfo {
                pid: 1,
                name: "init".into(),
                command: None,
                cpu: 0.0,
                memory: 0,
                user: Some("root".into()),
            }])
        }
    }

    fn update(server_id: serde_json::Value) -> serde_json::Value {
        json!({
            "serverId": server_id,
            "processes": [{ "pid": 42, "name": "nginx", "cpu": 1.5, "memory": 1024 }]
        })
    }

    #[tokio::test]
    async fn test_subscribe_update_unsubscribe() {
        let conn = MemoryConnection::new();
        let source = Arc::new(CountingSource::default());
        let mut watcher = ProcessWatcher::attach("5", conn.clone(), source, Duration::from_secs(30));
        assert_eq!(conn.emitted_named(SUBSCRIBE), vec![json!({ "serverId": "5" })]);

        conn.deliver(UPDATE, update(json!(6)));
        conn.deliver(UPDATE, update(json!(5)));
        let mut pushed = false;
        while let Some(event) = watcher.subscription.try_recv() {
            pushed |= watcher.handle_event(&event);
        }
        assert!(pushed);
        assert_eq!(watcher.processes()[0].name, "nginx");

        drop(watcher);
        assert_eq!(conn.emitted_named(UNSUBSCRIBE), vec![json!({ "serverId": "5" })]);
    }

    #[tokio::test]
    async fn test_first_poll_is_immediate_and_reconnect_resubscribes() {
        let conn = MemoryConnection::new();
        let source = Arc::new(CountingSource::default());
        let mut watcher = ProcessWatcher::attach("5", conn.clone(), source.clone(), Duration::from_secs(30));

        assert_eq!(watcher.next_update().await, Some(ProcessUpdate::Polled));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.processes()[0].pid, 1);

        conn.simulate_drop();
        conn.simulate_reconnect();
        assert_eq!(watcher.next_update().await, Some(ProcessUpdate::Resubscribed));
        assert_eq!(conn.emitted_named(SUBSCRIBE).len(), 2);
    }
}
