//! Reconnecting socket connection.
//!
//! [`SocketConnection`] owns a background task that manages the transport
//! lifecycle: connect (WebSocket first, long-polling as fallback), route
//! inbound frames to subscriptions, flush outbound frames, and reconnect
//! with exponential backoff.
//!
//! # Architecture
//!
//! ```text
//!   SocketConnection                       background task
//!        │ emit() ── mpsc(256) ─────────►  run_connection_loop
//!        │                                   │  connect (ws → polling)
//!        │ subscribe() ◄── EventRouter ◄──── │  route inbound frames
//!        │ reconnects() ◄── broadcast ◄───── │  notice after each reconnect
//!        │ close() ── CancellationToken ───► │  exit
//! ```
//!
//! Frames emitted while disconnected stay queued in the outbound channel
//! and are flushed once a transport is up again.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::polling::PollingTransport;
use super::transport::{Transport, WebSocketTransport};
use super::{
    Connection, ConnectionError, ConnectionFactory, ConnectionState, EventRouter, Frame,
    ReconnectNotice, Subscription,
};
use crate::auth::TokenStore;
use crate::config::Config;

/// Maximum frames queued while the transport is down.
pub const OUTBOUND_BUFFER: usize = 256;

/// Tunables for socket connections.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Server base URL (`http(s)://host[:port]`).
    pub base_url: String,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
    /// Allow the long-polling fallback.
    pub allow_polling: bool,
    /// Client used by the polling transport.
    pub http: reqwest::Client,
}

impl SocketOptions {
    /// Options derived from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.base_url().to_string(),
            reconnect_initial: config.reconnect_initial(),
            reconnect_max: config.reconnect_max(),
            allow_polling: true,
            http: reqwest::Client::new(),
        }
    }
}

/// Factory for [`SocketConnection`]s.
#[derive(Debug, Clone)]
pub struct SocketFactory {
    options: SocketOptions,
}

impl SocketFactory {
    /// Create a factory.
    pub fn new(options: SocketOptions) -> Self {
        Self { options }
    }
}

impl ConnectionFactory for SocketFactory {
    fn connect(&self, tokens: &TokenStore) -> Arc<dyn Connection> {
        Arc::new(SocketConnection::spawn(self.options.clone(), tokens.clone()))
    }
}

#[derive(Debug)]
struct Shared {
    router: Arc<EventRouter>,
    state: Mutex<ConnectionState>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }
}

/// Shared connection backed by a real network transport.
///
/// Must be created inside a Tokio runtime. Dropping it shuts the background
/// task down.
#[derive(Debug)]
pub struct SocketConnection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
}

impl SocketConnection {
    /// Spawn the background task and return immediately.
    pub fn spawn(options: SocketOptions, tokens: TokenStore) -> Self {
        let shared = Arc::new(Shared {
            router: EventRouter::new(),
            state: Mutex::new(ConnectionState::Unconnected),
        });
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_connection_loop(
            Arc::clone(&shared),
            options,
            tokens,
            outbound_rx,
            shutdown.clone(),
        ));

        Self {
            shared,
            outbound,
            shutdown,
        }
    }
}

impl Connection for SocketConnection {
    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn subscribe(&self, events: &[&str]) -> Subscription {
        self.shared.router.subscribe(events)
    }

    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .try_send(Frame::new(event, payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(frame) => {
                    log::warn!("[Socket] Outbound buffer full, dropping '{}'", frame.event);
                    ConnectionError::BufferFull
                }
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            })
    }

    fn reconnects(&self) -> broadcast::Receiver<ReconnectNotice> {
        self.shared.router.reconnects()
    }

    fn close(&self) {
        self.shutdown.cancel();
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Closed;
        self.shared.router.close();
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Doubling backoff with a cap.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Result of the inner message loop.
enum LoopExit {
    /// Shutdown was requested.
    Shutdown,
    /// Transport lost; reconnect.
    Disconnected,
}

async fn open_transport(options: &SocketOptions, token: Option<&str>) -> anyhow::Result<Box<dyn Transport>> {
    match WebSocketTransport::connect(&options.base_url, token).await {
        Ok(ws) => Ok(Box::new(ws)),
        Err(ws_err) if options.allow_polling => {
            log::debug!("[Socket] WebSocket unavailable ({ws_err:#}), trying long-polling");
            let polling = PollingTransport::connect(options.http.clone(), &options.base_url, token)
                .await
                .map_err(|e| e.context(format!("websocket: {ws_err:#}")))?;
            Ok(Box::new(polling))
        }
        Err(ws_err) => Err(ws_err),
    }
}

/// Main connection loop with reconnection and outbound buffering.
async fn run_connection_loop(
    shared: Arc<Shared>,
    options: SocketOptions,
    tokens: TokenStore,
    mut outbound_rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) {
    let mut backoff = Backoff::new(options.reconnect_initial, options.reconnect_max);
    let mut connects: u64 = 0;
    // Frame whose send failed; retried first on the next transport.
    let mut unsent: Option<Frame> = None;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        shared.set_state(ConnectionState::Connecting);
        let token = tokens.access_token();
        log::info!("[Socket] Connecting to {}", options.base_url);

        let opened = tokio::select! {
            () = shutdown.cancelled() => break,
            opened = open_transport(&options, token.as_deref()) => opened,
        };

        let mut transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                let delay = backoff.next_delay();
                log::warn!("[Socket] Connection failed: {e:#} (retry in {}ms)", delay.as_millis());
                if sleep_or_shutdown(delay, &shutdown).await {
                    break;
                }
                continue;
            }
        };

        log::info!("[Socket] Connected via {}", transport.kind());
        backoff.reset();
        shared.set_state(ConnectionState::Connected);
        if connects > 0 {
            shared.router.notify_reconnect(ReconnectNotice { reconnect: connects });
        }
        connects += 1;

        let exit = run_message_loop(&shared, transport.as_mut(), &mut outbound_rx, &mut unsent, &shutdown).await;
        transport.close().await;

        match exit {
            LoopExit::Shutdown => break,
            LoopExit::Disconnected => {
                shared.set_state(ConnectionState::Disconnected);
                let delay = backoff.next_delay();
                log::info!("[Socket] Disconnected, reconnecting in {}ms", delay.as_millis());
                if sleep_or_shutdown(delay, &shutdown).await {
                    break;
                }
            }
        }
    }

    log::info!("[Socket] Connection loop exited");
    *shared.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Closed;
    shared.router.close();
}

/// Returns `true` when shutdown was requested during the sleep.
async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

/// Inner loop for one established transport.
async fn run_message_loop(
    shared: &Shared,
    transport: &mut dyn Transport,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    unsent: &mut Option<Frame>,
    shutdown: &CancellationToken,
) -> LoopExit {
    if let Some(frame) = unsent.take() {
        if let Err(e) = transport.send(&frame).await {
            log::warn!("[Socket] Failed to flush '{}': {e:#}", frame.event);
            *unsent = Some(frame);
            return LoopExit::Disconnected;
        }
    }

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return LoopExit::Shutdown,

            inbound = transport.recv() => match inbound {
                Some(Ok(frame)) => {
                    shared.router.dispatch(&frame.event, frame.data);
                }
                Some(Err(e)) => {
                    log::warn!("[Socket] Transport error: {e:#}");
                    return LoopExit::Disconnected;
                }
                None => {
                    log::info!("[Socket] Transport ended");
                    return LoopExit::Disconnected;
                }
            },

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = transport.send(&frame).await {
                    log::warn!("[Socket] Failed to send '{}': {e:#}", frame.event);
                    *unsent = Some(frame);
                    return LoopExit::Disconnected;
                }
                log::trace!("[Socket] Sent '{}'", frame.event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(base_url: &str) -> SocketOptions {
        SocketOptions {
            base_url: base_url.to_string(),
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
            allow_polling: true,
            http: reqwest::Client::new(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_falls_back_to_polling_and_routes_frames() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/realtime/poll/handshake"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sid": "abc" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/realtime/poll"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "event": "deployment:status", "data": { "status": "running" } }]))
                    .set_delay(Duration::from_millis(20)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/realtime/poll"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let conn = SocketConnection::spawn(options(&server.uri()), TokenStore::in_memory());
        let mut sub = conn.subscribe(&["deployment:status"]);
        conn.emit("join:deployment", json!({ "deploymentId": "7" })).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["status"], "running");
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.emit("x", json!(null)), Err(ConnectionError::Closed));
        let ended = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert!(ended.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_stays_disconnected() {
        let conn = SocketConnection::spawn(options("http://127.0.0.1:1"), TokenStore::in_memory());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            conn.state(),
            ConnectionState::Connecting | ConnectionState::Disconnected
        ));
        // Emits are buffered while disconnected.
        conn.emit("terminal:data", json!({ "termId": 1, "data": "x" })).unwrap();
    }

    #[tokio::test]
    async fn test_buffer_full_while_disconnected() {
        let conn = SocketConnection::spawn(options("http://127.0.0.1:1"), TokenStore::in_memory());
        for _ in 0..OUTBOUND_BUFFER {
            conn.emit("terminal:data", json!({})).unwrap();
        }
        assert_eq!(conn.emit("terminal:data", json!({})), Err(ConnectionError::BufferFull));
    }
}
