//! In-process publish/subscribe over [`Event`](crate::message::Event).
//!
//! Hands each consumer its own `Stream` fed from a channel owned by the hub,
//! rather than a single `broadcast::Sender` shared ring buffer where one
//! slow subscriber lags all the others. Here each subscription owns an
//! independent bounded queue and drops its own oldest entry on overflow,
//! which is what a per-subscriber policy requires.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::warn;

use crate::message::{Event, EventPayload};

/// Default depth of a subscriber's queue before the oldest entry is
/// dropped to make room for the newest.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

struct SubscriberQueue {
    items: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        SubscriberQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Pushes `event`, dropping the oldest queued item if already at
    /// capacity. Returns true if an item was dropped.
    fn push(&self, event: Event) -> bool {
        let mut dropped = false;
        {
            let mut items = self.items.lock().expect("subscriber queue poisoned");
            if items.len() >= self.capacity {
                items.pop_front();
                dropped = true;
            }
            items.push_back(event);
        }
        self.notify.notify_one();
        dropped
    }

    async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut items = self.items.lock().expect("subscriber queue poisoned");
                if let Some(event) = items.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct Subscriber {
    queue: Arc<SubscriberQueue>,
    /// Optional filter: when present, only these event kinds are delivered.
    kinds: Option<Vec<&'static str>>,
}

/// The in-process event bus. Cheap to clone (wraps an `Arc`); every clone
/// shares the same subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    start: std::time::Instant,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(EventBusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                start: std::time::Instant::now(),
            }),
        }
    }

    /// Registers a new subscription, optionally filtered to a set of event
    /// kinds (see [`EventPayload::kind`]). `None` receives everything.
    pub fn subscribe(&self, kinds: Option<Vec<&'static str>>) -> Subscription {
        self.subscribe_with_capacity(kinds, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        &self,
        kinds: Option<Vec<&'static str>>,
        capacity: usize,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(capacity.max(1)));
        self.inner.subscribers.insert(
            id,
            Subscriber {
                queue: queue.clone(),
                kinds,
            },
        );
        Subscription {
            id,
            queue,
            bus: self.inner.clone(),
        }
    }

    /// Stamps `payload` with a header (or reuses one already attached by
    /// the caller via [`Event::new`]) and fans it out to every subscriber
    /// whose filter matches, in registration order. Never blocks: a full
    /// subscriber queue drops its own oldest entry.
    pub fn publish(&self, sender: impl Into<String>, payload: EventPayload) -> Event {
        let event = Event::new(sender, payload);
        self.publish_event(event)
    }

    /// Publishes an already-constructed event, stamping `event_time` with
    /// the bus's monotonic clock. Used by producers that pre-build the
    /// header (e.g. to set `sequence_id` before fan-out).
    pub fn publish_event(&self, mut event: Event) -> Event {
        event.header.event_time = self.inner.start.elapsed().as_nanos() as u64;
        let kind = event.kind();
        for entry in self.inner.subscribers.iter() {
            let subscriber = entry.value();
            if let Some(filter) = &subscriber.kinds {
                if !filter.contains(&kind) {
                    continue;
                }
            }
            if subscriber.queue.push(event.clone()) {
                warn!(kind, subscriber = entry.key(), "dropped oldest event on full subscriber queue");
            }
        }
        event
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// A live registration on an [`EventBus`]. Dropping it unsubscribes
/// idempotently.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Arc<EventBusInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.queue.recv().await
    }

    /// Idempotent early unsubscribe; also happens automatically on drop.
    pub fn unsubscribe(&mut self) {
        self.bus.subscribers.remove(&self.id);
        self.queue.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{DeviceRole, WaterLevelPayload};

    #[tokio::test]
    async fn publish_is_received_by_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(None);
        let mut b = bus.subscribe(None);

        bus.publish(
            "scale",
            EventPayload::WaterLevel(WaterLevelPayload {
                level_mm: 10.0,
                low_water_threshold_mm: 5.0,
            }),
        );

        assert_eq!(a.recv().await.unwrap().kind(), "WaterLevel");
        assert_eq!(b.recv().await.unwrap().kind(), "WaterLevel");
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_kinds() {
        let bus = EventBus::new();
        let mut only_connectivity = bus.subscribe(Some(vec!["Connectivity"]));

        bus.publish(
            "scale",
            EventPayload::WaterLevel(WaterLevelPayload {
                level_mm: 10.0,
                low_water_threshold_mm: 5.0,
            }),
        );
        bus.publish(
            "de1",
            EventPayload::Connectivity(crate::message::ConnectivityPayload {
                role: DeviceRole::De1,
                connected: true,
            }),
        );

        let received = only_connectivity.recv().await.unwrap();
        assert_eq!(received.kind(), "Connectivity");
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_not_newest() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_with_capacity(None, 2);

        for i in 0..4 {
            bus.publish(
                "scale",
                EventPayload::WaterLevel(WaterLevelPayload {
                    level_mm: i as f64,
                    low_water_threshold_mm: 5.0,
                }),
            );
        }

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        match (first.payload, second.payload) {
            (EventPayload::WaterLevel(a), EventPayload::WaterLevel(b)) => {
                assert_eq!(a.level_mm, 2.0);
                assert_eq!(b.level_mm, 3.0);
            }
            _ => panic!("unexpected payload"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }
}
