//! Server-sent-events push stream for one deployment.
//!
//! `GET {server}/api/deployments/{id}/stream?token=…` with named `log` and
//! `status` events. The token goes in the query string because event-stream
//! requests cannot carry headers in browsers; the server accepts both.
//!
//! The stream reconnects on its own after the connection ends, waiting for
//! the server's `retry:` hint (3 s until the server sends one). Reconnects
//! carry the last seen event `id:` as `Last-Event-ID` so the server can resume
//! after it instead of replaying its backlog. A 401 goes
//! through the refresh coordinator like any other call; if the refresh
//! fails, the stream stops.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{DeploymentStatus, LogEntry, StatusUpdate};
use crate::auth::{ensure_success, ApiClient, ApiError, ApiRequest};

/// Resume header sent on reconnect.
pub const LAST_EVENT_ID: &str = "Last-Event-ID";

/// Reconnect delay until the server sends a `retry:` hint.
pub const DEFAULT_RETRY: Duration = Duration::from_secs(3);

/// Event decoded from the push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// A log line.
    Log(LogEntry),
    /// A status change.
    Status(DeploymentStatus),
}

/// Handle to a running push stream. Dropping it stops the stream.
#[derive(Debug)]
pub struct PushStream {
    rx: mpsc::Receiver<PushEvent>,
    cancel: CancellationToken,
}

impl PushStream {
    /// Start streaming `deployment_id` in the background.
    pub fn open(client: ApiClient, deployment_id: &str) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        tokio::spawn(run_push_stream(
            client,
            deployment_id.to_string(),
            tx,
            cancel.clone(),
        ));
        Self { rx, cancel }
    }

    /// Next event; `None` once the stream stopped for good. Cancel-safe.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop the background task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why one stream attempt ended.
enum StreamEnd {
    /// Server closed the stream; reconnect.
    Closed,
    /// Transport or server error; reconnect.
    Failed(String),
    /// Nothing will fix this by retrying.
    Fatal(String),
    /// The [`PushStream`] handle is gone.
    ReceiverGone,
}

async fn run_push_stream(
    client: ApiClient,
    deployment_id: String,
    tx: mpsc::Sender<PushEvent>,
    cancel: CancellationToken,
) {
    let mut retry = DEFAULT_RETRY;
    let mut last_event_id = None;

    loop {
        let end = tokio::select! {
            () = cancel.cancelled() => return,
            end = consume_once(&client, &deployment_id, &tx, &mut retry, &mut last_event_id) => end,
        };

        match end {
            StreamEnd::Closed => {
                log::info!("[PushStream] Stream for deployment {deployment_id} ended, reconnecting");
            }
            StreamEnd::Failed(e) => {
                log::warn!(
                    "[PushStream] Stream for deployment {deployment_id} failed: {e} (retry in {}ms)",
                    retry.as_millis()
                );
            }
            StreamEnd::Fatal(e) => {
                log::warn!("[PushStream] Giving up on deployment {deployment_id}: {e}");
                return;
            }
            StreamEnd::ReceiverGone => return,
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(retry) => {}
        }
    }
}

async fn consume_once(
    client: &ApiClient,
    deployment_id: &str,
    tx: &mpsc::Sender<PushEvent>,
    retry: &mut Duration,
    last_event_id: &mut Option<String>,
) -> StreamEnd {
    let mut request = ApiRequest::get(format!("/api/deployments/{deployment_id}/stream"))
        .token_in_query()
        .accept("text/event-stream")
        .streaming();
    if let Some(id) = last_event_id.as_deref() {
        log::debug!("[PushStream] Resuming deployment {deployment_id} after event {id}");
        request = request.header(LAST_EVENT_ID, id);
    }

    let response = match client.send(&request).await {
        Ok(response) => response,
        Err(ApiError::Auth(e)) => return StreamEnd::Fatal(e.to_string()),
        Err(e) => return StreamEnd::Failed(e.to_string()),
    };
    let response = match ensure_success(response).await {
        Ok(response) => response,
        Err(e) if is_permanent(e.status()) => return StreamEnd::Fatal(e.to_string()),
        Err(e) => return StreamEnd::Failed(e.to_string()),
    };

    log::debug!("[PushStream] Connected to deployment {deployment_id}");
    let mut events = response.bytes_stream().eventsource();

    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => return StreamEnd::Failed(e.to_string()),
        };
        if let Some(hint) = event.retry {
            *retry = hint;
        }
        if !event.id.is_empty() {
            *last_event_id = Some(event.id.clone());
        }
        let Some(decoded) = decode_event(&event.event, &event.data) else {
            continue;
        };
        if tx.send(decoded).await.is_err() {
            return StreamEnd::ReceiverGone;
        }
    }

    StreamEnd::Closed
}

/// Client errors other than timeouts and rate limiting will not go away.
fn is_permanent(status: Option<StatusCode>) -> bool {
    status.is_some_and(|s| {
        s.is_client_error() && s != StatusCode::REQUEST_TIMEOUT && s != StatusCode::TOO_MANY_REQUESTS
    })
}

/// Decode one named SSE event. Unknown names and bad payloads are dropped.
pub(crate) fn decode_event(name: &str, data: &str) -> Option<PushEvent> {
    let decoded = match name {
        "log" => serde_json::from_str::<LogEntry>(data).map(PushEvent::Log),
        "status" => serde_json::from_str::<StatusUpdate>(data).map(|u| PushEvent::Status(u.status)),
        _ => {
            log::trace!("[PushStream] Ignoring event '{name}'");
            return None;
        }
    };
    match decoded {
        Ok(event) => Some(event),
        Err(e) => {
            log::trace!("[PushStream] Dropping malformed '{name}' event: {e}");
            None
        }
    }
}
