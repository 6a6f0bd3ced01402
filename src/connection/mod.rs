//! Shared realtime connection.
//!
//! One bidirectional connection per process carries every realtime feature:
//! terminal multiplexing, deployment rooms and process listings. Features
//! never open their own socket; they ask the [`ConnectionManager`] for the
//! shared [`Connection`] and add/remove [`Subscription`]s on it.
//!
//! # Architecture
//!
//! ```text
//!   ConnectionManager ── get_or_connect() ──► Arc<dyn Connection>
//!         │                                        │
//!         │ ConnectionFactory                      ├── subscribe(&[events]) → Subscription
//!         ▼                                        ├── emit(event, payload)
//!   SocketConnection                               └── reconnects() → ReconnectNotice
//!   (background task: websocket, falling back
//!    to long-polling; backoff; emit buffer)
//! ```
//!
//! Server-side room membership does not survive a transport reconnect.
//! Components that joined rooms listen on [`Connection::reconnects`] and
//! re-join.

pub mod frame;
pub mod memory;
pub mod polling;
pub mod router;
pub mod socket;
pub mod transport;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::auth::TokenStore;
use crate::config::Config;

pub use frame::Frame;
pub use router::{EventRouter, InboundEvent, Subscription};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Created, no connect attempt yet.
    #[default]
    Unconnected,
    /// Handshake in progress.
    Connecting,
    /// Transport established.
    Connected,
    /// Transport lost; reconnecting.
    Disconnected,
    /// Explicitly torn down; never reconnects.
    Closed,
}

/// Sent on every successful connect after the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectNotice {
    /// 1 for the first reconnect, 2 for the second, and so on.
    pub reconnect: u64,
}

/// Errors returned by [`Connection::emit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection was closed explicitly.
    Closed,
    /// Too many frames are waiting for the transport to come back.
    BufferFull,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Connection closed"),
            Self::BufferFull => write!(f, "Outbound buffer full while disconnected"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// A shared, multiplexed realtime connection.
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Receive every future event whose name is in `events`, in arrival order.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    fn subscribe(&self, events: &[&str]) -> Subscription;

    /// Send an event to the server.
    ///
    /// Frames emitted while disconnected are buffered and flushed after the
    /// next successful connect.
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), ConnectionError>;

    /// Notifications fired after each transport-level reconnect.
    fn reconnects(&self) -> broadcast::Receiver<ReconnectNotice>;

    /// Close the connection. Only the [`ConnectionManager`] should call this.
    fn close(&self);
}

/// Creates connections for the [`ConnectionManager`].
pub trait ConnectionFactory: Send + Sync + std::fmt::Debug {
    /// Open a new connection. Each (re)connect reads the current access token
    /// from `tokens`.
    fn connect(&self, tokens: &TokenStore) -> Arc<dyn Connection>;
}

#[derive(Debug)]
struct Slot {
    connection: Arc<dyn Connection>,
    identity_epoch: u64,
}

/// Owner of the single shared connection.
///
/// Construct one per process and hand out `Arc<ConnectionManager>`.
#[derive(Debug)]
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    tokens: TokenStore,
    slot: Mutex<Option<Slot>>,
}

impl ConnectionManager {
    /// Create a manager with an explicit factory.
    pub fn new(factory: Arc<dyn ConnectionFactory>, tokens: TokenStore) -> Self {
        Self {
            factory,
            tokens,
            slot: Mutex::new(None),
        }
    }

    /// Manager using the websocket/long-polling socket transport.
    pub fn for_server(config: &Config, tokens: TokenStore) -> Self {
        let factory = socket::SocketFactory::new(socket::SocketOptions::from_config(config));
        Self::new(Arc::new(factory), tokens)
    }

    /// Return the live shared connection, creating it if needed.
    ///
    /// A new connection replaces the current one when it was closed or when
    /// the logged-in identity changed since it was created.
    pub fn get_or_connect(&self) -> Arc<dyn Connection> {
        let epoch = self.tokens.identity_epoch();
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = slot.as_ref() {
            let closed = current.connection.state() == ConnectionState::Closed;
            if !closed && current.identity_epoch == epoch {
                return Arc::clone(&current.connection);
            }
            if !closed {
                log::info!("[Socket] Credentials changed, replacing shared connection");
                current.connection.close();
            }
        }

        log::debug!("[Socket] Creating shared connection");
        let connection = self.factory.connect(&self.tokens);
        *slot = Some(Slot {
            connection: Arc::clone(&connection),
            identity_epoch: epoch,
        });
        connection
    }

    /// The current connection without creating one.
    pub fn current(&self) -> Option<Arc<dyn Connection>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|slot| Arc::clone(&slot.connection))
    }

    /// Close the shared connection and clear the slot.
    pub fn disconnect(&self) {
        let previous = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(slot) = previous {
            log::info!("[Socket] Closing shared connection");
            slot.connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryConnectionFactory;
    use super::*;
    use crate::auth::TokenPair;

    fn manager() -> (ConnectionManager, Arc<MemoryConnectionFactory>, TokenStore) {
        let factory = Arc::new(MemoryConnectionFactory::default());
        let tokens = TokenStore::with_pair(TokenPair::new("a".into(), "r".into()));
        let manager = ConnectionManager::new(factory.clone(), tokens.clone());
        (manager, factory, tokens)
    }

    #[test]
    fn test_get_or_connect_reuses_connection() {
        let (manager, factory, _) = manager();
        let first = manager.get_or_connect();
        let second = manager.get_or_connect();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created().len(), 1);
    }

    #[test]
    fn test_reconnecting_connection_is_still_reused() {
        let (manager, factory, _) = manager();
        manager.get_or_connect();
        factory.created()[0].simulate_drop();
        manager.get_or_connect();
        assert_eq!(factory.created().len(), 1);
    }

    #[test]
    fn test_disconnect_clears_slot() {
        let (manager, factory, _) = manager();
        let first = manager.get_or_connect();
        manager.disconnect();
        assert_eq!(first.state(), ConnectionState::Closed);
        assert!(manager.current().is_none());

        let second = manager.get_or_connect();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created().len(), 2);
    }

    #[test]
    fn test_credential_change_recreates_connection() {
        let (manager, factory, tokens) = manager();
        let first = manager.get_or_connect();

        tokens.rotate(TokenPair::new("a2".into(), "r2".into()));
        assert!(Arc::ptr_eq(&first, &manager.get_or_connect()));

        tokens.login(TokenPair::new("other".into(), "user".into()));
        let second = manager.get_or_connect();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), ConnectionState::Closed);
        assert_eq!(factory.created().len(), 2);
    }
}
