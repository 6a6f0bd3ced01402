//! Merges the push stream and the shared connection into one view.
//!
//! # Architecture
//!
//! ```text
//!   PushStream (SSE) ── log/status ──┐
//!                                    ├──► DeploymentReconciler ──► ReconcilerUpdate
//!   Connection ── deployment:* ──────┘         │
//!        │ reconnects() ──► re-join room       │ terminal status
//!        ▼                                     ▼
//!   join/leave:deployment            DeploymentStore::history (once)
//!                                    DeploymentStore::fetch (every 10 s while idle)
//! ```
//!
//! Both channels deliver the same lines; the [`DedupWindow`] keyed by
//! `timestamp|text` makes each line appear once. Statuses are last write
//! wins; while the deployment is idle a periodic pass re-reads the
//! authoritative status and corrects any stale overwrite.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::dedup::{DedupWindow, DEFAULT_CAPACITY, DEFAULT_RETAIN};
use super::store::DeploymentStore;
use super::stream::{PushEvent, PushStream};
use super::types::{DeploymentRecord, DeploymentStatus, LogEntry, SocketLog, Source, StatusUpdate};
use crate::config::Config;
use crate::connection::{Connection, InboundEvent, ReconnectNotice, Subscription};

/// `join:deployment` (client → server).
pub const JOIN: &str = "join:deployment";
/// `leave:deployment` (client → server).
pub const LEAVE: &str = "leave:deployment";
/// `deployment:log` (server → client).
pub const LOG: &str = "deployment:log";
/// `deployment:status` (server → client).
pub const STATUS: &str = "deployment:status";

const MIN_RECONCILE_INTERVAL: Duration = Duration::from_millis(100);

/// Client-side view of one deployment.
#[derive(Debug, Clone)]
pub struct DeploymentStreamState {
    deployment_id: String,
    status: Option<DeploymentStatus>,
    logs: Vec<LogEntry>,
    dedup: DedupWindow,
    in_progress: bool,
}

impl DeploymentStreamState {
    /// Fresh state; a deployment of unknown status counts as in progress.
    pub fn new(deployment_id: impl Into<String>, dedup: DedupWindow) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            status: None,
            logs: Vec::new(),
            dedup,
            in_progress: true,
        }
    }

    /// Deployment id.
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Canonical status, once known.
    pub fn status(&self) -> Option<DeploymentStatus> {
        self.status
    }

    /// Accepted log lines in arrival order.
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Whether the deployment has not reached a terminal status.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Append a line unless its key is inside the dedup horizon.
    pub fn apply_log(&mut self, entry: LogEntry) -> bool {
        if !self.dedup.insert(entry.dedup_key()) {
            return false;
        }
        self.logs.push(entry);
        true
    }

    /// Overwrite the status and report how progress changed.
    pub fn apply_status(&mut self, status: DeploymentStatus) -> Progress {
        self.status = Some(status);
        match (self.in_progress, status.is_terminal()) {
            (true, true) => {
                self.in_progress = false;
                Progress::Finished
            }
            (false, false) => {
                self.in_progress = true;
                Progress::Restarted
            }
            _ => Progress::Unchanged,
        }
    }
}

/// Progress transition caused by a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No transition.
    Unchanged,
    /// In progress → terminal.
    Finished,
    /// Terminal → in progress (a redeploy).
    Restarted,
}

/// Change reported by [`DeploymentReconciler::next_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerUpdate {
    /// A new (deduplicated) log line.
    Log(LogEntry),
    /// The canonical status was written.
    Status {
        /// New status.
        status: DeploymentStatus,
        /// Channel it came from.
        source: Source,
    },
    /// Deployment history was re-read after a terminal status.
    HistoryRefreshed(Vec<DeploymentRecord>),
    /// The room was re-joined.
    Rejoined,
    /// The push stream stopped for good; the socket channel remains.
    PushStreamEnded,
}

/// Tunables for [`DeploymentReconciler`].
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Idle reconciliation interval.
    pub reconcile_interval: Duration,
    /// Dedup window trim threshold.
    pub dedup_capacity: usize,
    /// Keys kept after a trim.
    pub dedup_retain: usize,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            dedup_capacity: DEFAULT_CAPACITY,
            dedup_retain: DEFAULT_RETAIN,
        }
    }
}

impl ReconcilerOptions {
    /// Options from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconcile_interval: config.status_reconcile_interval(),
            dedup_capacity: config.dedup_capacity,
            dedup_retain: config.dedup_retain,
        }
    }
}

/// Live view of one deployment over both channels.
///
/// Dropping it leaves the room (fire-and-forget) and stops the push stream.
#[derive(Debug)]
pub struct DeploymentReconciler {
    state: DeploymentStreamState,
    connection: Arc<dyn Connection>,
    subscription: Subscription,
    reconnects: broadcast::Receiver<ReconnectNotice>,
    push: Option<PushStream>,
    store: Arc<dyn DeploymentStore>,
    history: Vec<DeploymentRecord>,
    history_pending: bool,
    rejoin_pending: bool,
    reconcile_tick: Interval,
    pending: VecDeque<ReconcilerUpdate>,
    joined: bool,
}

impl DeploymentReconciler {
    /// Attach to a deployment.
    ///
    /// Reads the authoritative status first; if the deployment is still in
    /// progress (or the read fails) the room is joined.
    pub async fn attach(
        deployment_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        store: Arc<dyn DeploymentStore>,
        push: Option<PushStream>,
        options: ReconcilerOptions,
    ) -> Self {
        let deployment_id = deployment_id.into();
        let subscription = connection.subscribe(&[LOG, STATUS]);
        let reconnects = connection.reconnects();

        let period = options.reconcile_interval.max(MIN_RECONCILE_INTERVAL);
        let mut reconcile_tick = tokio::time::interval_at(Instant::now() + period, period);
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reconciler = Self {
            state: DeploymentStreamState::new(
                deployment_id.clone(),
                DedupWindow::new(options.dedup_capacity, options.dedup_retain),
            ),
            connection,
            subscription,
            reconnects,
            push,
            store,
            history: Vec::new(),
            history_pending: false,
            rejoin_pending: false,
            reconcile_tick,
            pending: VecDeque::new(),
            joined: false,
        };

        match reconciler.store.fetch(&deployment_id).await {
            Ok(record) => {
                reconciler.state.apply_status(record.status);
                reconciler.pending.push_back(ReconcilerUpdate::Status {
                    status: record.status,
                    source: Source::Reconcile,
                });
            }
            Err(e) => log::warn!("[Deploy] Could not read deployment {deployment_id}: {e}"),
        }

        if reconciler.state.is_in_progress() {
            reconciler.join();
        }
        reconciler
    }

    /// Current view.
    pub fn state(&self) -> &DeploymentStreamState {
        &self.state
    }

    /// History from the most recent refresh.
    pub fn history(&self) -> &[DeploymentRecord] {
        &self.history
    }

    /// Wait for the next change. `None` when every input is gone.
    pub async fn next_update(&mut self) -> Option<ReconcilerUpdate> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }
            if std::mem::take(&mut self.rejoin_pending) {
                return Some(ReconcilerUpdate::Rejoined);
            }
            if self.history_pending {
                self.refresh_history().await;
                continue;
            }

            let idle = !self.state.is_in_progress();
            let has_push = self.push.is_some();
            tokio::select! {
                Some(event) = self.subscription.recv() => {
                    if let Some(update) = self.handle_socket_event(&event) {
                        self.pending.push_back(update);
                    }
                }
                event = recv_push(&mut self.push), if has_push => match event {
                    Some(event) => {
                        if let Some(update) = self.handle_push_event(event) {
                            self.pending.push_back(update);
                        }
                    }
                    None => {
                        self.push = None;
                        self.pending.push_back(ReconcilerUpdate::PushStreamEnded);
                    }
                },
                notice = self.reconnects.recv() => match notice {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(update) = self.handle_reconnect() {
                            self.pending.push_back(update);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = self.reconcile_tick.tick(), if idle => {
                    self.reconcile_status().await;
                }
                else => return None,
            }
        }
    }

    /// Apply a `deployment:log` / `deployment:status` event from the socket.
    pub fn handle_socket_event(&mut self, event: &InboundEvent) -> Option<ReconcilerUpdate> {
        match event.name.as_str() {
            LOG => {
                let log: SocketLog = decode(&event.name, &event.payload)?;
                if !self.is_mine(log.deployment_id.as_deref()) {
                    return None;
                }
                self.accept_log(log.entry)
            }
            STATUS => {
                let update: StatusUpdate = decode(&event.name, &event.payload)?;
                if !self.is_mine(update.deployment_id.as_deref()) {
                    return None;
                }
                Some(self.accept_status(update.status, Source::Socket))
            }
            _ => None,
        }
    }

    /// Apply an event from the push stream.
    pub fn handle_push_event(&mut self, event: PushEvent) -> Option<ReconcilerUpdate> {
        match event {
            PushEvent::Log(entry) => self.accept_log(entry),
            PushEvent::Status(status) => Some(self.accept_status(status, Source::PushStream)),
        }
    }

    /// React to one reconnect of the shared connection: re-join the room
    /// exactly once while the deployment is in progress.
    pub fn handle_reconnect(&mut self) -> Option<ReconcilerUpdate> {
        if !self.state.is_in_progress() {
            return None;
        }
        log::info!(
            "[Deploy] Connection re-established, re-joining deployment {}",
            self.state.deployment_id()
        );
        self.join();
        Some(ReconcilerUpdate::Rejoined)
    }

    /// One idle reconciliation pass. Does nothing while in progress.
    pub async fn reconcile_status(&mut self) {
        if self.state.is_in_progress() {
            return;
        }
        let id = self.state.deployment_id().to_string();
        match self.store.fetch(&id).await {
            Ok(record) => {
                if self.state.status() != Some(record.status) {
                    log::debug!("[Deploy] Reconciled status of {id} to {}", record.status);
                    let update = self.accept_status(record.status, Source::Reconcile);
                    self.pending.push_back(update);
                }
            }
            Err(e) => log::debug!("[Deploy] Status reconciliation for {id} failed: {e}"),
        }
    }

    fn accept_log(&mut self, entry: LogEntry) -> Option<ReconcilerUpdate> {
        if self.state.apply_log(entry.clone()) {
            Some(ReconcilerUpdate::Log(entry))
        } else {
            None
        }
    }

    fn accept_status(&mut self, status: DeploymentStatus, source: Source) -> ReconcilerUpdate {
        match self.state.apply_status(status) {
            Progress::Finished => {
                log::info!("[Deploy] Deployment {} finished: {status}", self.state.deployment_id());
                self.history_pending = true;
                self.reconcile_tick.reset();
            }
            Progress::Restarted => {
                log::info!("[Deploy] Deployment {} is active again", self.state.deployment_id());
                self.join();
                self.rejoin_pending = true;
            }
            Progress::Unchanged => {}
        }
        ReconcilerUpdate::Status { status, source }
    }

    async fn refresh_history(&mut self) {
        let id = self.state.deployment_id().to_string();
        match self.store.history(&id).await {
            Ok(history) => {
                self.history = history.clone();
                self.pending.push_back(ReconcilerUpdate::HistoryRefreshed(history));
            }
            Err(e) => log::warn!("[Deploy] History refresh for {id} failed: {e}"),
        }
        self.history_pending = false;
    }

    fn is_mine(&self, deployment_id: Option<&str>) -> bool {
        match deployment_id {
            Some(id) if id != self.state.deployment_id() => {
                log::trace!("[Deploy] Dropping event for deployment {id}");
                false
            }
            _ => true,
        }
    }

    fn join(&mut self) {
        let payload = serde_json::json!({ "deploymentId": self.state.deployment_id() });
        match self.connection.emit(JOIN, payload) {
            Ok(()) => self.joined = true,
            Err(e) => log::warn!("[Deploy] Failed to join deployment room: {e}"),
        }
    }
}

impl Drop for DeploymentReconciler {
    fn drop(&mut self) {
        if self.joined {
            let payload = serde_json::json!({ "deploymentId": self.state.deployment_id() });
            let _ = self.connection.emit(LEAVE, payload);
        }
        if let Some(push) = &self.push {
            push.cancel();
        }
    }
}

async fn recv_push(push: &mut Option<PushStream>) -> Option<PushEvent> {
    match push {
        Some(push) => push.recv().await,
        None => std::future::pending().await,
    }
}

fn decode<T: serde::de::DeserializeOwned>(name: &str, payload: &serde_json::Value) -> Option<T> {
    match serde_json::from_value(payload.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            log::trace!("[Deploy] Dropping malformed {name} payload: {e}");
            None
        }
    }
}
