//! State-change and progress events
//!
//! Consumers (a desktop notifier, an attribute fallback, tests) subscribe to
//! an [`EventBus`] and receive every event published after they subscribed.
//! Publishing never waits: each subscriber has a bounded buffer, and a full
//! buffer loses the event rather than stalling the transition that produced
//! it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metadata_store::ItemState;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

/// A committed lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub id: String,
    /// `None` when the record was just created
    pub prior_state: Option<ItemState>,
    pub new_state: ItemState,
    /// Record version written by the commit
    pub version: i64,
    pub timestamp: OffsetDateTime,
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged(StateChange),

    HydrationProgress { id: String, bytes: u64, total: u64 },

    UploadProgress { id: String, bytes: u64, total: u64 },
}

impl EngineEvent {
    pub fn id(&self) -> &str {
        match self {
            EngineEvent::StateChanged(change) => &change.id,
            EngineEvent::HydrationProgress { id, .. } | EngineEvent::UploadProgress { id, .. } => {
                id
            }
        }
    }
}

/// Fan-out of engine events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    subscribers: Mutex<Vec<flume::Sender<EngineEvent>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                subscribers: Mutex::new(Vec::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::bounded(self.inner.capacity);
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber without blocking.
    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
    }

    /// Events lost to full subscriber buffers since creation
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str, version: i64) -> EngineEvent {
        EngineEvent::StateChanged(StateChange {
            id: id.to_string(),
            prior_state: Some(ItemState::Ghost),
            new_state: ItemState::Hydrating,
            version,
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    #[test]
    fn test_every_subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(change("x", 1));
        bus.publish(change("x", 2));

        for rx in [a, b] {
            let versions: Vec<i64> = rx
                .drain()
                .map(|e| match e {
                    EngineEvent::StateChanged(c) => c.version,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            assert_eq!(versions, vec![1, 2]);
        }
    }

    #[test]
    fn test_full_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new(1);
        let rx = bus.subscribe();

        bus.publish(change("x", 1));
        bus.publish(change("x", 2));

        assert_eq!(bus.dropped(), 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_disconnected_subscriber_is_removed() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();
        drop(rx);

        bus.publish(change("x", 1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::HydrationProgress {
            id: "x".into(),
            bytes: 1,
            total: 2,
        });
        assert_eq!(bus.dropped(), 0);
    }
}
