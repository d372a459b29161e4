//! In-process event bus.
//!
//! Fan-out is synchronous and in subscription order: every listener
//! registered for a channel at publish time is invoked exactly once before
//! `publish` returns. There is no buffering or replay; a listener that
//! subscribes after an event was published never sees it.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Listener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Proof of subscription; hand it back to [`EventBus::unsubscribe`].
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
}

struct Registration {
    id: u64,
    channel: String,
    listener: Listener,
}

pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Registration>>,
    // Serializes whole fan-outs so every session observes concurrent
    // publishes in the same relative order. Listener callbacks run while
    // this is held and must not publish.
    publish_lock: Mutex<()>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            publish_lock: Mutex::new(()),
        }
    }

    /// Register a listener for one channel. Safe to call from inside a
    /// listener callback.
    pub fn subscribe<F>(&self, channel: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Registration {
            id,
            channel: channel.to_string(),
            listener: Arc::new(listener),
        });
        ListenerHandle { id }
    }

    /// Remove a listener. Consuming the handle makes double removal a
    /// compile error. Safe to call from inside a listener callback.
    pub fn unsubscribe(&self, handle: ListenerHandle) {
        self.listeners.lock().retain(|r| r.id != handle.id);
    }

    /// Deliver an event to every listener currently subscribed to
    /// `channel`, in subscription order.
    pub fn publish(&self, channel: &str, payload: &Value) {
        let _ordering = self.publish_lock.lock();
        // Snapshot under the registry lock, invoke outside it, so a
        // callback can subscribe or unsubscribe without deadlocking.
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|r| r.channel == channel)
            .map(|r| Arc::clone(&r.listener))
            .collect();
        for listener in snapshot {
            listener(channel, payload);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listeners_fire_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.subscribe("pairs:updated", move |_, _| seen.lock().push(tag));
        }

        bus.publish("pairs:updated", &json!({}));
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn events_only_reach_the_matching_channel() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counted = Arc::clone(&hits);
        bus.subscribe("tokens:updated", move |_, _| {
            counted.fetch_add(1, Ordering::Relaxed);
        });

        bus.publish("pairs:updated", &json!({}));
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        bus.publish("tokens:updated", &json!({}));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsubscribed_listeners_stop_receiving() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counted = Arc::clone(&hits);
        let handle = bus.subscribe("tokens:updated", move |_, _| {
            counted.fetch_add(1, Ordering::Relaxed);
        });

        bus.publish("tokens:updated", &json!({}));
        bus.unsubscribe(handle);
        bus.publish("tokens:updated", &json!({}));

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.publish("tokens:updated", &json!({ "id": "early" }));

        let hits = Arc::new(AtomicU64::new(0));
        let counted = Arc::clone(&hits);
        bus.subscribe("tokens:updated", move |_, _| {
            counted.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn a_listener_may_unsubscribe_itself_mid_callback() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

        let handle = {
            let bus = Arc::clone(&bus);
            let hits = Arc::clone(&hits);
            let slot = Arc::clone(&slot);
            bus.clone().subscribe("metrics:updated", move |_, _| {
                hits.fetch_add(1, Ordering::Relaxed);
                if let Some(own) = slot.lock().take() {
                    bus.unsubscribe(own);
                }
            })
        };
        *slot.lock() = Some(handle);

        bus.publish("metrics:updated", &json!({}));
        bus.publish("metrics:updated", &json!({}));

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn a_listener_may_remove_a_peer_mid_publish() {
        let bus = Arc::new(EventBus::new());
        let peer_hits = Arc::new(AtomicU64::new(0));
        let peer_slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

        {
            let bus = Arc::clone(&bus);
            let peer_slot = Arc::clone(&peer_slot);
            bus.clone().subscribe("tokens:updated", move |_, _| {
                if let Some(peer) = peer_slot.lock().take() {
                    bus.unsubscribe(peer);
                }
            });
        }
        let counted = Arc::clone(&peer_hits);
        let peer = bus.subscribe("tokens:updated", move |_, _| {
            counted.fetch_add(1, Ordering::Relaxed);
        });
        *peer_slot.lock() = Some(peer);

        // The peer was subscribed when the first publish began, so it
        // still sees that event; afterwards it is gone.
        bus.publish("tokens:updated", &json!({}));
        bus.publish("tokens:updated", &json!({}));

        assert_eq!(peer_hits.load(Ordering::Relaxed), 1);
        assert_eq!(bus.listener_count(), 1);
    }
}
