//! Application-wide publish/subscribe event bus.
//!
//! Components never hold references to each other beyond what is passed at
//! construction; all cross-component signaling (provisioning lifecycle, WiFi
//! loss/restore, resets, button taps, countdown ticks) goes through this bus.
//!
//! Delivery is synchronous and in registration order. There is **no
//! isolation between subscribers**: if a callback returns an error, `publish`
//! propagates it to the publisher and later subscribers for that event are
//! not invoked. Downstream code may rely on ordering side effects, so this
//! sharp edge is kept deliberately.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Direction of the countdown relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDirection {
    /// Deadline is in the future.
    Until,
    /// Deadline has passed.
    Since,
}

/// Per-second countdown breakdown carried by [`Event::TickChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickBreakdown {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    pub direction: TickDirection,
}

/// Topics a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    EnteringProvisioning,
    ExitingProvisioning,
    WifiConnected,
    WifiReset,
    ButtonTapped,
    FactoryResetRequested,
    SoftResetRequested,
    TickChanged,
}

/// A published event with its payload.
#[derive(Debug, Clone)]
pub enum Event {
    EnteringProvisioning,
    ExitingProvisioning,
    WifiConnected,
    WifiReset,
    ButtonTapped,
    FactoryResetRequested,
    SoftResetRequested,
    TickChanged(TickBreakdown),
}

impl Event {
    /// Topic this event is delivered on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::EnteringProvisioning => Topic::EnteringProvisioning,
            Self::ExitingProvisioning => Topic::ExitingProvisioning,
            Self::WifiConnected => Topic::WifiConnected,
            Self::WifiReset => Topic::WifiReset,
            Self::ButtonTapped => Topic::ButtonTapped,
            Self::FactoryResetRequested => Topic::FactoryResetRequested,
            Self::SoftResetRequested => Topic::SoftResetRequested,
            Self::TickChanged(_) => Topic::TickChanged,
        }
    }
}

/// Error raised by a subscriber callback and propagated to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventError(pub String);

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber failed: {}", self.0)
    }
}

impl std::error::Error for EventError {}

/// Subscriber callback. Must be safe to call from any thread.
pub type Callback = Box<dyn FnMut(&Event) -> Result<(), EventError> + Send>;

/// Handle identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Registered = (SubscriptionId, Arc<Mutex<Callback>>);

struct Registry {
    subscribers: HashMap<Topic, Vec<Registered>>,
    next_id: u64,
}

/// Publish/subscribe registry shared across the application as `Arc<EventBus>`.
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                subscribers: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    /// Register a callback for a topic, preserving registration order.
    pub fn subscribe(&self, topic: Topic, callback: Callback) -> SubscriptionId {
        let mut registry = self.registry.lock().unwrap();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry
            .subscribers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(Mutex::new(callback))));
        id
    }

    /// Remove one registration. Unsubscribing an unknown pair is a no-op.
    pub fn unsubscribe(&self, topic: Topic, id: SubscriptionId) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(list) = registry.subscribers.get_mut(&topic) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                registry.subscribers.remove(&topic);
            }
        }
    }

    /// Invoke every currently-registered callback for the event's topic,
    /// synchronously and in registration order.
    ///
    /// The first callback error aborts delivery to later subscribers and is
    /// returned to the publisher. Each callback runs under its own lock, so
    /// a callback that publishes the topic it handles deadlocks on itself;
    /// handlers must only publish other topics.
    pub fn publish(&self, event: &Event) -> Result<(), EventError> {
        // Snapshot under the lock, invoke outside it: callbacks may
        // subscribe or unsubscribe re-entrantly.
        let snapshot: Vec<Registered> = {
            let registry = self.registry.lock().unwrap();
            match registry.subscribers.get(&event.topic()) {
                Some(list) => list.clone(),
                None => return Ok(()),
            }
        };

        for (_, callback) in snapshot {
            let mut callback = callback.lock().unwrap();
            (callback)(event)?;
        }
        Ok(())
    }

    /// Number of subscribers currently registered for a topic.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let registry = self.registry.lock().unwrap();
        registry.subscribers.get(&topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert!(bus.publish(&Event::ButtonTapped).is_ok());
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = order.clone();
            bus.subscribe(
                Topic::ButtonTapped,
                Box::new(move |_| {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }),
            );
        }

        bus.publish(&Event::ButtonTapped).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failing_subscriber_blocks_later_subscribers() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));

        let reached_first = reached.clone();
        bus.subscribe(
            Topic::WifiReset,
            Box::new(move |_| {
                reached_first.fetch_add(1, Ordering::SeqCst);
                Err(EventError("boom".into()))
            }),
        );
        let reached_second = reached.clone();
        bus.subscribe(
            Topic::WifiReset,
            Box::new(move |_| {
                reached_second.fetch_add(100, Ordering::SeqCst);
                Ok(())
            }),
        );

        let result = bus.publish(&Event::WifiReset);
        assert_eq!(result, Err(EventError("boom".into())));
        // Second subscriber never ran.
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_only_one_registration() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_a = count.clone();
        let id_a = bus.subscribe(
            Topic::TickChanged,
            Box::new(move |_| {
                count_a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let count_b = count.clone();
        bus.subscribe(
            Topic::TickChanged,
            Box::new(move |_| {
                count_b.fetch_add(10, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.unsubscribe(Topic::TickChanged, id_a);
        let tick = TickBreakdown {
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 1,
            direction: TickDirection::Until,
        };
        bus.publish(&Event::TickChanged(tick)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_unsubscribe_unknown_pair_is_noop() {
        let bus = EventBus::new();
        let id = bus.subscribe(Topic::ButtonTapped, Box::new(|_| Ok(())));
        bus.unsubscribe(Topic::WifiReset, id);
        bus.unsubscribe(Topic::ButtonTapped, id);
        bus.unsubscribe(Topic::ButtonTapped, id);
        assert_eq!(bus.subscriber_count(Topic::ButtonTapped), 0);
    }

    #[test]
    fn test_event_payload_reaches_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));

        let seen_clone = seen.clone();
        bus.subscribe(
            Topic::TickChanged,
            Box::new(move |event| {
                if let Event::TickChanged(tick) = event {
                    *seen_clone.lock().unwrap() = Some(*tick);
                }
                Ok(())
            }),
        );

        let tick = TickBreakdown {
            days: 1,
            hours: 2,
            minutes: 3,
            seconds: 4,
            direction: TickDirection::Since,
        };
        bus.publish(&Event::TickChanged(tick)).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(tick));
    }
}
