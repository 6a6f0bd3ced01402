//! Fan-out of inbound events to subscriptions.
//!
//! The router also carries the reconnect notices. Closing it drops every
//! sender, so pending `recv` calls on subscriptions and reconnect receivers
//! resolve to "gone" instead of waiting forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{broadcast, mpsc};

use super::ReconnectNotice;

const RECONNECT_CAPACITY: usize = 16;

/// An event delivered to a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Event name.
    pub name: String,
    /// Event payload (`null` when absent).
    pub payload: serde_json::Value,
}

#[derive(Debug)]
struct RouterInner {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<InboundEvent>)>>,
    /// `None` once closed.
    reconnect_tx: Option<broadcast::Sender<ReconnectNotice>>,
}

/// Routes inbound events by name to every live subscription.
#[derive(Debug)]
pub struct EventRouter {
    inner: Mutex<RouterInner>,
}

impl Default for EventRouter {
    fn default() -> Self {
        let (reconnect_tx, _) = broadcast::channel(RECONNECT_CAPACITY);
        Self {
            inner: Mutex::new(RouterInner {
                next_id: 0,
                handlers: HashMap::new(),
                reconnect_tx: Some(reconnect_tx),
            }),
        }
    }
}

impl EventRouter {
    /// Create an empty router.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscription for a set of event names.
    ///
    /// On a closed router the subscription is born finished.
    pub fn subscribe(self: &Arc<Self>, events: &[&str]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        if inner.reconnect_tx.is_none() {
            drop(tx);
            return Subscription {
                id,
                events: events.iter().map(|e| (*e).to_string()).collect(),
                rx,
                router: Weak::new(),
            };
        }
        for event in events {
            inner
                .handlers
                .entry((*event).to_string())
                .or_default()
                .push((id, tx.clone()));
        }
        Subscription {
            id,
            events: events.iter().map(|e| (*e).to_string()).collect(),
            rx,
            router: Arc::downgrade(self),
        }
    }

    /// Deliver an event; returns how many subscriptions received it.
    pub fn dispatch(&self, name: &str, payload: serde_json::Value) -> usize {
        let mut inner = self.lock();
        let Some(handlers) = inner.handlers.get_mut(name) else {
            log::trace!("[Socket] No subscriber for {name}");
            return 0;
        };

        handlers.retain(|(_, tx)| !tx.is_closed());
        for (_, tx) in handlers.iter() {
            let _ = tx.send(InboundEvent {
                name: name.to_string(),
                payload: payload.clone(),
            });
        }
        handlers.len()
    }

    /// Receiver for reconnect notices. Reports `Closed` once the router is.
    pub fn reconnects(&self) -> broadcast::Receiver<ReconnectNotice> {
        match &self.lock().reconnect_tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Announce a transport-level reconnect.
    pub fn notify_reconnect(&self, notice: ReconnectNotice) {
        if let Some(tx) = &self.lock().reconnect_tx {
            let _ = tx.send(notice);
        }
    }

    /// Drop every subscription sender and the reconnect sender. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.handlers.clear();
        inner.reconnect_tx = None;
    }

    /// Whether [`EventRouter::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.lock().reconnect_tx.is_none()
    }

    /// Number of live subscriptions for an event name.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lock()
            .handlers
            .get(name)
            .map_or(0, |handlers| handlers.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }

    fn unsubscribe(&self, id: u64, events: &[String]) {
        let mut inner = self.lock();
        for event in events {
            if let Some(handlers) = inner.handlers.get_mut(event) {
                handlers.retain(|(handler_id, _)| *handler_id != id);
                if handlers.is_empty() {
                    inner.handlers.remove(event);
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of a subscription; unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    events: Vec<String>,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
    router: Weak<EventRouter>,
}

impl Subscription {
    /// Wait for the next event. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }

    /// Event names this subscription listens to.
    pub fn events(&self) -> &[String] {
        &self.events
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.id, &self.events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_preserves_order_across_event_names() {
        let router = EventRouter::new();
        let mut sub = router.subscribe(&["a", "b"]);

        router.dispatch("a", json!(1));
        router.dispatch("b", json!(2));
        router.dispatch("a", json!(3));

        let names: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| (e.name, e.payload))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
                ("a".to_string(), json!(3)),
            ]
        );
    }

    #[test]
    fn test_drop_unsubscribes() {
        let router = EventRouter::new();
        let sub = router.subscribe(&["terminal:output"]);
        let _other = router.subscribe(&["terminal:output"]);
        assert_eq!(router.subscriber_count("terminal:output"), 2);

        drop(sub);
        assert_eq!(router.subscriber_count("terminal:output"), 1);
        assert_eq!(router.dispatch("terminal:output", json!("x")), 1);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_reconnects() {
        let router = EventRouter::new();
        let mut sub = router.subscribe(&["terminal:output"]);
        let mut reconnects = router.reconnects();

        router.close();
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            reconnects.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        let mut late = router.subscribe(&["terminal:output"]);
        assert!(late.recv().await.is_none());
        assert_eq!(router.dispatch("terminal:output", json!("x")), 0);
        assert!(router.is_closed());
    }

    #[test]
    fn test_unknown_event_is_dropped() {
        let router = EventRouter::new();
        assert_eq!(router.dispatch("nobody:listens", json!(null)), 0);
    }
}
