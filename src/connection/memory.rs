//! In-process connection.
//!
//! Implements [`Connection`] without a network: inbound events are injected
//! with [`MemoryConnection::deliver`], emitted frames are recorded, and
//! transport drops/reconnects are driven by hand. Used by tests and by
//! embedders that bridge events from another transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use super::{
    Connection, ConnectionError, ConnectionFactory, ConnectionState, EventRouter, Frame,
    ReconnectNotice, Subscription,
};
use crate::auth::TokenStore;

/// A connection whose "server" is the caller.
#[derive(Debug)]
pub struct MemoryConnection {
    router: Arc<EventRouter>,
    state: Mutex<ConnectionState>,
    emitted: Mutex<Vec<Frame>>,
    reconnects: AtomicU64,
    access_token: Option<String>,
}

impl MemoryConnection {
    /// A connected in-memory connection.
    pub fn new() -> Arc<Self> {
        Self::with_token(None)
    }

    fn with_token(access_token: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            router: EventRouter::new(),
            state: Mutex::new(ConnectionState::Connected),
            emitted: Mutex::new(Vec::new()),
            reconnects: AtomicU64::new(0),
            access_token,
        })
    }

    /// Access token the connection was opened with.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Inject a server→client event. Returns how many subscriptions got it.
    pub fn deliver(&self, event: &str, payload: serde_json::Value) -> usize {
        self.router.dispatch(event, payload)
    }

    /// Every frame emitted so far.
    pub fn emitted(&self) -> Vec<Frame> {
        self.emitted.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Payloads of emitted frames with the given event name.
    pub fn emitted_named(&self, event: &str) -> Vec<serde_json::Value> {
        self.emitted()
            .into_iter()
            .filter(|f| f.event == event)
            .map(|f| f.data)
            .collect()
    }

    /// Drain the emitted frame log.
    pub fn take_emitted(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.emitted.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of live subscriptions for an event.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.router.subscriber_count(event)
    }

    /// Mark the transport as lost.
    pub fn simulate_drop(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    /// Mark the transport as re-established and notify listeners.
    pub fn simulate_reconnect(&self) {
        self.set_state(ConnectionState::Connected);
        let reconnect = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        self.router.notify_reconnect(ReconnectNotice { reconnect });
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }
}

impl Connection for MemoryConnection {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, events: &[&str]) -> Subscription {
        self.router.subscribe(events)
    }

    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Frame::new(event, payload));
        Ok(())
    }

    fn reconnects(&self) -> broadcast::Receiver<ReconnectNotice> {
        self.router.reconnects()
    }

    fn close(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Closed;
        self.router.close();
    }
}

/// Factory producing [`MemoryConnection`]s and remembering each one.
#[derive(Debug, Default)]
pub struct MemoryConnectionFactory {
    created: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryConnectionFactory {
    /// Connections created so far, oldest first.
    pub fn created(&self) -> Vec<Arc<MemoryConnection>> {
        self.created.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ConnectionFactory for MemoryConnectionFactory {
    fn connect(&self, tokens: &TokenStore) -> Arc<dyn Connection> {
        let connection = MemoryConnection::with_token(tokens.access_token());
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&connection));
        connection
    }
}
