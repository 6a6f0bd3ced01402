//! Several shell sessions over one shared connection.
//!
//! Every outbound message carries the session's `termId`; every inbound
//! message is applied only to the session whose id it carries. Legacy
//! untagged events apply to the active session.
//!
//! The multiplexer is owned by one task (`&mut self` API). Inbound events
//! are consumed either by awaiting [`TerminalMultiplexer::next_event`] or by
//! draining [`TerminalMultiplexer::poll_events`] from a render loop.

use std::sync::Arc;

use super::protocol::{
    self, cd_command, to_value, ClosePayload, DataPayload, Inbound, ResizePayload, SessionId,
    StartPayload,
};
use super::session::{SessionState, TerminalSession};
use super::transcript::DEFAULT_SCROLLBACK_BYTES;
use super::TerminalError;
use crate::connection::{Connection, ConnectionError, InboundEvent, Subscription};

/// Something visible changed for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexerEvent {
    /// The session became ready and was focused.
    Ready(SessionId),
    /// New output was appended to the session's transcript.
    Output(SessionId),
    /// The remote process exited.
    Exited(SessionId),
}

/// Result of [`TerminalMultiplexer::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Session removed; other sessions remain.
    Removed {
        /// Session that is active now.
        next_active: Option<SessionId>,
    },
    /// The last session was closed; the owning view should collapse.
    LastSessionClosed,
    /// No such session (already closed).
    NotFound,
}

/// Shell sessions for one server, multiplexed over the shared connection.
#[derive(Debug)]
pub struct TerminalMultiplexer {
    connection: Arc<dyn Connection>,
    subscription: Subscription,
    server_id: String,
    sessions: Vec<TerminalSession>,
    active: Option<SessionId>,
    scrollback_bytes: usize,
}

impl TerminalMultiplexer {
    /// Attach to `connection` for shells on `server_id`.
    pub fn new(connection: Arc<dyn Connection>, server_id: impl Into<String>) -> Self {
        Self::with_scrollback(connection, server_id, DEFAULT_SCROLLBACK_BYTES)
    }

    /// Attach with a custom per-session transcript size.
    pub fn with_scrollback(
        connection: Arc<dyn Connection>,
        server_id: impl Into<String>,
        scrollback_bytes: usize,
    ) -> Self {
        let subscription = connection.subscribe(&protocol::INBOUND_EVENTS);
        Self {
            connection,
            subscription,
            server_id: server_id.into(),
            sessions: Vec::new(),
            active: None,
            scrollback_bytes,
        }
    }

    /// Server the sessions run on.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Register a session in the `Created` state.
    ///
    /// # Errors
    ///
    /// [`TerminalError::DuplicateSession`] if the id is already listed.
    pub fn open(
        &mut self,
        id: SessionId,
        title: impl Into<String>,
        working_directory: Option<String>,
    ) -> Result<(), TerminalError> {
        if self.index_of(id).is_some() {
            return Err(TerminalError::DuplicateSession(id));
        }
        self.sessions.push(TerminalSession::new(
            id,
            title.into(),
            working_directory,
            self.scrollback_bytes,
        ));
        if self.active.is_none() {
            self.active = Some(id);
        }
        log::debug!("[Terminal] Opened session {id}");
        Ok(())
    }

    /// Ask the server to start the shell for a created session.
    ///
    /// # Errors
    ///
    /// Unknown id, a session past `Created`, zero geometry, or a closed
    /// connection.
    pub fn start(&mut self, id: SessionId, rows: u16, cols: u16) -> Result<(), TerminalError> {
        if rows == 0 || cols == 0 {
            return Err(TerminalError::InvalidGeometry { rows, cols });
        }
        let idx = self.index_of(id).ok_or(TerminalError::UnknownSession(id))?;
        if self.sessions[idx].state() != SessionState::Created {
            return Err(TerminalError::AlreadyStarted(id));
        }

        let payload = to_value(&StartPayload {
            server_id: &self.server_id,
            term_id: id,
            rows,
            cols,
        });
        self.connection
            .emit(protocol::START, payload)
            .map_err(TerminalError::Connection)?;

        let session = &mut self.sessions[idx];
        session.set_state(SessionState::Starting);
        session.set_geometry(rows, cols);
        log::info!("[Terminal] Starting session {id} ({rows}x{cols})");
        Ok(())
    }

    /// Forward keystrokes. Returns `false` when the input was dropped
    /// because the session is unknown or closed.
    pub fn send_input(&mut self, id: SessionId, data: &str) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        if !self.sessions[idx].state().is_open() {
            return false;
        }
        self.emit(protocol::DATA, to_value(&DataPayload { term_id: id, data }))
    }

    /// Send new geometry. Returns `true` if a resize was emitted.
    ///
    /// Zero rows/cols (hidden widget) and unchanged geometry are suppressed.
    pub fn resize(&mut self, id: SessionId, rows: u16, cols: u16) -> bool {
        if rows == 0 || cols == 0 {
            return false;
        }
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        let session = &self.sessions[idx];
        if !session.state().is_open() || session.geometry() == Some((rows, cols)) {
            return false;
        }
        if session.state() == SessionState::Created {
            // Not started yet; the geometry goes out with terminal:start.
            return false;
        }

        let sent = self.emit(
            protocol::RESIZE,
            to_value(&ResizePayload {
                term_id: id,
                rows,
                cols,
            }),
        );
        if sent {
            self.sessions[idx].set_geometry(rows, cols);
        }
        sent
    }

    /// Close a session's tab. Idempotent.
    pub fn close(&mut self, id: SessionId) -> CloseOutcome {
        let Some(idx) = self.index_of(id) else {
            return CloseOutcome::NotFound;
        };

        self.sessions[idx].set_state(SessionState::Closing);
        self.emit(protocol::CLOSE, to_value(&ClosePayload { term_id: id }));
        self.sessions.remove(idx);
        log::debug!("[Terminal] Closed session {id}");

        if self.sessions.is_empty() {
            self.active = None;
            return CloseOutcome::LastSessionClosed;
        }

        if self.active == Some(id) {
            let next = idx.min(self.sessions.len() - 1);
            self.active = Some(self.sessions[next].id());
        }
        CloseOutcome::Removed {
            next_active: self.active,
        }
    }

    /// Focus a session. Returns `false` for unknown ids.
    pub fn select(&mut self, id: SessionId) -> bool {
        if self.index_of(id).is_none() {
            return false;
        }
        self.active = Some(id);
        true
    }

    /// Active session id.
    pub fn active(&self) -> Option<SessionId> {
        self.active
    }

    /// Look up a session.
    pub fn session(&self, id: SessionId) -> Option<&TerminalSession> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    /// Sessions in tab order.
    pub fn sessions(&self) -> &[TerminalSession] {
        &self.sessions
    }

    /// Apply one inbound connection event.
    pub fn handle(&mut self, event: &InboundEvent) -> Option<MultiplexerEvent> {
        let Some(inbound) = Inbound::decode(&event.name, &event.payload) else {
            log::trace!("[Terminal] Ignoring malformed {} payload", event.name);
            return None;
        };

        let id = match inbound.term_id() {
            Some(id) => id,
            None => self.untagged_target()?,
        };
        let Some(idx) = self.index_of(id) else {
            log::trace!("[Terminal] Dropping {} for unknown session {id}", event.name);
            return None;
        };
        if !self.sessions[idx].state().is_open() {
            return None;
        }

        match inbound {
            Inbound::Ready { .. } => self.on_ready(idx),
            Inbound::Output { data, .. } => {
                self.sessions[idx].append(data.as_bytes());
                Some(MultiplexerEvent::Output(id))
            }
            Inbound::Exit { .. } => {
                self.sessions[idx].mark_exited();
                log::info!("[Terminal] Session {id} exited");
                Some(MultiplexerEvent::Exited(id))
            }
        }
    }

    /// Apply every event already queued, without waiting.
    pub fn poll_events(&mut self) -> Vec<MultiplexerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.subscription.try_recv() {
            if let Some(change) = self.handle(&event) {
                events.push(change);
            }
        }
        events
    }

    /// Wait for the next visible change. `None` once the connection is gone.
    ///
    /// Cancel-safe.
    pub async fn next_event(&mut self) -> Option<MultiplexerEvent> {
        loop {
            let event = self.subscription.recv().await?;
            if let Some(change) = self.handle(&event) {
                return Some(change);
            }
        }
    }

    fn on_ready(&mut self, idx: usize) -> Option<MultiplexerEvent> {
        let id = self.sessions[idx].id();
        match self.sessions[idx].state() {
            SessionState::Created | SessionState::Starting => {}
            _ => return None,
        }

        self.sessions[idx].set_state(SessionState::Ready);
        if let Some(dir) = self.sessions[idx].take_cd() {
            let command = cd_command(&dir);
            self.emit(
                protocol::DATA,
                to_value(&DataPayload {
                    term_id: id,
                    data: &command,
                }),
            );
        }
        self.sessions[idx].set_state(SessionState::Active);
        self.active = Some(id);
        log::info!("[Terminal] Session {id} ready");
        Some(MultiplexerEvent::Ready(id))
    }

    /// Target for a legacy untagged event: the active session, or the only
    /// session when there is exactly one.
    fn untagged_target(&self) -> Option<SessionId> {
        self.active.or_else(|| match self.sessions.as_slice() {
            [only] => Some(only.id()),
            _ => None,
        })
    }

    fn index_of(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id() == id)
    }

    fn emit(&self, event: &str, payload: serde_json::Value) -> bool {
        match self.connection.emit(event, payload) {
            Ok(()) => true,
            Err(ConnectionError::Closed) => {
                log::debug!("[Terminal] Connection closed, dropping {event}");
                false
            }
            Err(e) => {
                log::warn!("[Terminal] Failed to emit {event}: {e}");
                false
            }
        }
    }
}

impl Drop for TerminalMultiplexer {
    fn drop(&mut self) {
        for session in &self.sessions {
            let _ = self.connection.emit(
                protocol::CLOSE,
                to_value(&ClosePayload {
                    term_id: session.id(),
                }),
            );
        }
    }
}
