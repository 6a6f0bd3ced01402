//! HTTP long-polling transport.
//!
//! Used when the WebSocket handshake fails (proxies that strip upgrades).
//!
//! # Protocol
//!
//! - `GET {server}/realtime/poll/handshake` → `{"sid": "..."}`
//! - `GET {server}/realtime/poll?sid=...` blocks until frames are available
//!   and returns a JSON array of frames (possibly empty on server timeout)
//! - `POST {server}/realtime/poll?sid=...` with a JSON array of frames
//!
//! The receive side runs on a background task that pumps frames into a
//! channel, which keeps [`Transport::recv`] cancel-safe.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::transport::{Transport, TransportKind};
use super::Frame;

/// Upper bound for one long-poll request (server holds for ~25 s).
const POLL_TIMEOUT: Duration = Duration::from_secs(40);

/// Timeout for the handshake and for sends.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Handshake {
    sid: String,
}

/// Long-polling transport bound to one server session id.
#[derive(Debug)]
pub struct PollingTransport {
    http: reqwest::Client,
    poll_url: String,
    sid: String,
    access_token: Option<String>,
    inbound: mpsc::Receiver<Result<Frame>>,
    cancel: CancellationToken,
}

impl PollingTransport {
    /// Perform the handshake and start the receive pump.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake request fails or returns no sid.
    pub async fn connect(
        http: reqwest::Client,
        base_url: &str,
        access_token: Option<&str>,
    ) -> Result<Self> {
        let poll_url = format!("{}/realtime/poll", base_url.trim_end_matches('/'));

        let mut request = http
            .get(format!("{poll_url}/handshake"))
            .timeout(REQUEST_TIMEOUT);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        let handshake: Handshake = request
            .send()
            .await
            .context("polling handshake failed")?
            .error_for_status()
            .context("polling handshake rejected")?
            .json()
            .await
            .context("invalid polling handshake response")?;
        anyhow::ensure!(!handshake.sid.is_empty(), "polling handshake returned empty sid");

        log::debug!("[Socket] Long-polling session established");

        let (tx, inbound) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        tokio::spawn(run_poll_loop(
            http.clone(),
            poll_url.clone(),
            handshake.sid.clone(),
            access_token.map(str::to_string),
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            http,
            poll_url,
            sid: handshake.sid,
            access_token: access_token.map(str::to_string),
            inbound,
            cancel,
        })
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut request = self
            .http
            .post(&self.poll_url)
            .query(&[("sid", self.sid.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .json(&[frame]);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .context("polling send failed")?
            .error_for_status()
            .context("polling send rejected")?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_poll_loop(
    http: reqwest::Client,
    poll_url: String,
    sid: String,
    access_token: Option<String>,
    tx: mpsc::Sender<Result<Frame>>,
    cancel: CancellationToken,
) {
    loop {
        let mut request = http
            .get(&poll_url)
            .query(&[("sid", sid.as_str())])
            .timeout(POLL_TIMEOUT);
        if let Some(token) = &access_token {
            request = request.bearer_auth(token);
        }

        let result = tokio::select! {
            () = cancel.cancelled() => return,
            result = poll_once(request) => result,
        };

        match result {
            Ok(frames) => {
                for frame in frames {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                // The transport is done after the first failure; the socket
                // loop reconnects with a fresh handshake.
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

async fn poll_once(request: reqwest::RequestBuilder) -> Result<Vec<Frame>> {
    let body = request
        .send()
        .await
        .context("long-poll request failed")?
        .error_for_status()
        .context("long-poll rejected")?
        .text()
        .await
        .context("long-poll body read failed")?;
    Frame::decode_batch(&body).context("invalid long-poll batch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_handshake_receive_and_send() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/realtime/poll/handshake"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sid": "s1" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/realtime/poll"))
            .and(query_param("sid", "s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "event": "terminal:output", "data": { "termId": 1, "data": "hi" } }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/realtime/poll"))
            .and(query_param("sid", "s1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut transport = PollingTransport::connect(reqwest::Client::new(), &server.uri(), Some("tok"))
            .await
            .unwrap();
        assert_eq!(transport.kind(), TransportKind::Polling);

        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame.event, "terminal:output");

        transport
            .send(&Frame::new("terminal:data", json!({ "termId": 1, "data": "ls" })))
            .await
            .unwrap();
        transport.close().await;
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/realtime/poll/handshake"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = PollingTransport::connect(reqwest::Client::new(), &server.uri(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_poll_failure_surfaces_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/realtime/poll/handshake"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sid": "s2" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/realtime/poll"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let mut transport = PollingTransport::connect(reqwest::Client::new(), &server.uri(), None)
            .await
            .unwrap();
        assert!(transport.recv().await.unwrap().is_err());
        assert!(transport.recv().await.is_none());
    }
}
