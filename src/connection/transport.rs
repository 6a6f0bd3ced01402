//! Transport abstraction and the WebSocket transport.
//!
//! A [`Transport`] moves [`Frame`]s over one physical link. The socket loop
//! owns exactly one transport at a time and replaces it on reconnect.
//!
//! # Cancellation
//!
//! [`Transport::recv`] must be cancel-safe: the socket loop polls it inside
//! `tokio::select!` next to the outbound queue and the shutdown token.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use super::Frame;

/// Concrete WebSocket stream type.
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Which physical transport carries the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Full-duplex WebSocket.
    WebSocket,
    /// HTTP long-polling fallback.
    Polling,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// One established physical link.
#[async_trait]
pub trait Transport: Send + std::fmt::Debug {
    /// Transport kind, for logging.
    fn kind(&self) -> TransportKind;

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the link is broken.
    async fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Next inbound frame; `None` when the link ended. Cancel-safe.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    /// Close the link (best effort).
    async fn close(&mut self);
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug)]
pub struct WebSocketTransport {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WebSocketTransport {
    /// Open a WebSocket to `{base_url}/realtime`, authenticated with a
    /// Bearer token when one is available.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL or token is malformed or the handshake
    /// fails.
    pub async fn connect(base_url: &str, access_token: Option<&str>) -> Result<Self> {
        use tungstenite::client::IntoClientRequest;

        let url = realtime_ws_url(base_url);
        let mut request = url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid WebSocket URL: {url}"))?;

        if let Some(token) = access_token {
            let value = tungstenite::http::HeaderValue::from_str(&format!("Bearer {token}"))
                .context("invalid Authorization header value")?;
            request
                .headers_mut()
                .insert(tungstenite::http::header::AUTHORIZATION, value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("WebSocket connect failed")?;
        let (sink, stream) = ws_stream.split();
        Ok(Self { sink, stream })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let text = frame.encode().context("frame encode failed")?;
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .context("WebSocket send failed")
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => match Frame::decode(&text) {
                    Ok(frame) => return Some(Ok(frame)),
                    Err(e) => {
                        log::trace!(
                            "[Socket] Dropping undecodable frame ({e}): {}",
                            &text[..text.len().min(100)]
                        );
                    }
                },
                Ok(tungstenite::Message::Ping(data)) => {
                    if let Err(e) = self.sink.send(tungstenite::Message::Pong(data)).await {
                        return Some(Err(anyhow::anyhow!("WebSocket pong failed: {e}")));
                    }
                }
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    log::info!("[Socket] Server closed WebSocket (code={code} reason={reason})");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}

/// WebSocket endpoint for a server base URL.
pub(crate) fn realtime_ws_url(base_url: &str) -> String {
    format!("{}/realtime", http_to_ws_scheme(base_url.trim_end_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://example.com"), "wss://example.com");
        assert_eq!(http_to_ws_scheme("http://localhost:4000"), "ws://localhost:4000");
        assert_eq!(http_to_ws_scheme("wss://example.com/x"), "wss://example.com/x");
    }

    #[test]
    fn test_realtime_ws_url() {
        assert_eq!(
            realtime_ws_url("https://app.opsdeck.dev/"),
            "wss://app.opsdeck.dev/realtime"
        );
        assert_eq!(realtime_ws_url("http://localhost:4000"), "ws://localhost:4000/realtime");
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        assert!(WebSocketTransport::connect("not-a-url", None).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        assert!(WebSocketTransport::connect("http://127.0.0.1:1", Some("t"))
            .await
            .is_err());
    }
}
