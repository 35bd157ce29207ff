//! Broadcast + history fan-out for relay events.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{InboundEvent, RelayConfig, RelayEvent};

struct StoredEvent {
    event: RelayEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
}

/// Output sink for everything the relay observes.
///
/// Receive loops push events here; operator front-ends subscribe. New
/// subscribers can replay the retained history before switching to live
/// updates, so a console attached late still sees recent agent output.
pub struct EventHub {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<RelayEvent>,
    history_limit: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

impl EventHub {
    /// Create a hub with the given live capacity and history budget.
    #[must_use]
    pub fn new(capacity: usize, history_bytes: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            history_limit: history_bytes,
        }
    }

    /// Create a hub sized from `config`.
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.event_capacity, config.history_bytes)
    }

    /// Push an event to live subscribers and history.
    pub fn push(&self, event: RelayEvent) {
        let bytes = event.approx_bytes();

        // History and broadcast are updated under the same lock so a
        // subscriber taking a snapshot never misses or duplicates an event.
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.sender.send(event.clone()); // no live listeners is fine

        while inner.total_bytes.saturating_add(bytes) > self.history_limit {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        if bytes <= self.history_limit {
            inner.history.push_back(StoredEvent { event, bytes });
            inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        }
    }

    /// Push an inbound agent message.
    pub fn push_inbound(&self, event: InboundEvent) {
        self.push(RelayEvent::Inbound(event));
    }

    /// Get a receiver for live events only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of retained history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<RelayEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    /// Stream that yields history first, then live events.
    ///
    /// Events dropped because the subscriber lagged are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, RelayEvent> {
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<RelayEvent> = inner.history.iter().map(|s| s.event.clone()).collect();
            (history, self.sender.subscribe())
        };

        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                    None
                }
            }
        });

        futures::stream::iter(history).chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::AgentIdentity;

    fn identity(port: u16) -> AgentIdentity {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn inbound(port: u16, data: &'static [u8]) -> RelayEvent {
        RelayEvent::Inbound(InboundEvent::new(identity(port), Bytes::from_static(data)))
    }

    #[test]
    fn test_history_is_bounded() {
        let hub = EventHub::new(16, 200);
        hub.push(inbound(1, &[0; 50]));
        hub.push(inbound(1, &[1; 50]));
        hub.push(inbound(1, &[2; 50]));

        let history = hub.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], inbound(1, &[2; 50]));
    }

    #[test]
    fn test_oversized_event_not_retained() {
        let hub = EventHub::new(16, 10);
        hub.push(inbound(1, b"too big for history"));
        assert!(hub.history().is_empty());
    }

    #[tokio::test]
    async fn test_live_subscriber_receives_push() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        hub.push(inbound(7, b"hello"));
        assert_eq!(rx.recv().await.unwrap(), inbound(7, b"hello"));
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let hub = EventHub::default();
        hub.push(inbound(1, b"first"));
        let mut stream = hub.history_plus_stream();
        hub.push(inbound(1, b"second"));

        assert_eq!(stream.next().await.unwrap(), inbound(1, b"first"));
        assert_eq!(stream.next().await.unwrap(), inbound(1, b"second"));
    }
}
