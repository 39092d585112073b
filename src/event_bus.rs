//! In-process synchronous pub/sub over a fixed set of topics.
//!
//! Grounded on the teacher's `event_bus` subscription-list-plus-fan-out shape,
//! simplified from glob-pattern `CloudEvent` routing down to a closed topic
//! set dispatched on the calling thread — no channel, no background task.
//! Within a single public orchestrator call, every `emit` fully returns
//! (including running every subscriber) before the call itself returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The six topics the orchestrator emits on. Fixed by design — this bus
/// carries no arbitrary event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    ActionEnqueued,
    ActionCompleted,
    ActionFailed,
    PermissionNeeded,
    PermissionGranted,
    PermissionRevoked,
}

/// Payload delivered to subscribers. All payloads are plain JSON values —
/// the `ActionRequest` for action-topic events, `(handler_id,
/// permission_name, scope)` for `PermissionNeeded`, or the `PermissionGrant`
/// for grant/revoke topics — per spec.md §6.
pub type EventPayload = Value;

type Subscriber = dyn Fn(&EventPayload) + Send + Sync;

struct Entry {
    id: u64,
    topic: Topic,
    callback: Arc<Subscriber>,
}

/// Synchronous, in-process pub/sub bus. `emit` invokes each matching
/// subscriber in registration order on the calling thread; a panicking or
/// erroring subscriber is caught and logged, and subsequent subscribers
/// still run.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

/// Returned by [`EventBus::on`]. Call [`SubscriptionId::topic`] /
/// [`EventBus::unsubscribe`] to remove the subscription; dropping this
/// value does not unsubscribe (the bus, not the caller, owns the
/// subscriber's lifetime once registered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    id: u64,
    topic: Topic,
}

impl SubscriptionId {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers `callback` for `topic`. Returns a disposer token accepted
    /// by [`Self::unsubscribe`].
    pub fn on<F>(&self, topic: Topic, callback: F) -> SubscriptionId
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push(Entry {
            id,
            topic,
            callback: Arc::new(callback),
        });
        SubscriptionId { id, topic }
    }

    pub fn unsubscribe(&self, sub: SubscriptionId) {
        self.subscribers.lock().unwrap().retain(|e| e.id != sub.id);
    }

    /// Invokes every subscriber registered for `topic`, in registration
    /// order, on the calling thread. A subscriber that panics is caught via
    /// `catch_unwind` and logged; later subscribers still run.
    pub fn emit(&self, topic: Topic, payload: EventPayload) {
        // Clone out the matching callbacks and drop the lock before calling
        // any of them — subscriber code must never run while the lock is
        // held, or a subscriber calling back into `on`/`unsubscribe`/`emit`
        // would deadlock on this non-reentrant mutex.
        let matching: Vec<Arc<Subscriber>> = {
            let subs = self.subscribers.lock().unwrap();
            subs.iter()
                .filter(|e| e.topic == topic)
                .map(|e| e.callback.clone())
                .collect()
        };

        for callback in matching {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&payload)));
            if let Err(panic) = result {
                log::warn!("event subscriber for {topic:?} panicked: {panic:?}");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn emit_delivers_to_matching_subscriber() {
        let bus = EventBus::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        bus.on(Topic::ActionEnqueued, move |payload| {
            r.lock().unwrap().push(payload.clone());
        });

        bus.emit(Topic::ActionEnqueued, serde_json::json!({"id": "a1"}));

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["id"], "a1");
    }

    #[test]
    fn emit_does_not_cross_topics() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        bus.on(Topic::PermissionNeeded, move |_| *c.lock().unwrap() += 1);

        bus.emit(Topic::ActionCompleted, serde_json::json!({}));
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.on(Topic::ActionFailed, move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        bus.on(Topic::ActionFailed, move |_| o2.lock().unwrap().push(2));
        let o3 = order.clone();
        bus.on(Topic::ActionFailed, move |_| o3.lock().unwrap().push(3));

        bus.emit(Topic::ActionFailed, serde_json::json!({}));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        bus.on(Topic::ActionFailed, |_| panic!("boom"));
        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        bus.on(Topic::ActionFailed, move |_| *r.lock().unwrap() = true);

        bus.emit(Topic::ActionFailed, serde_json::json!({}));
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let sub = bus.on(Topic::PermissionGranted, move |_| *c.lock().unwrap() += 1);

        bus.emit(Topic::PermissionGranted, serde_json::json!({}));
        bus.unsubscribe(sub);
        bus.emit(Topic::PermissionGranted, serde_json::json!({}));

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
