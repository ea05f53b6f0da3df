//! Event Bus
//!
//! Topic-based publish/subscribe router. Listeners are invoked synchronously
//! on the publisher's thread and must not block; plugin runtimes only enqueue
//! the event into their mailbox.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace, warn};
use wildmatch::WildMatch;

use super::Event;

/// Receives events from the bus
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        (self)(event)
    }
}

/// Opaque handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    listener: Arc<dyn EventListener>,
    patterns: Vec<String>,
}

/// Central topic router
pub struct EventBus {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
    total_published: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            total_published: AtomicU64::new(0),
        }
    }

    /// Register a listener for a set of topic patterns
    pub fn subscribe<I, S>(&self, listener: Arc<dyn EventListener>, patterns: I) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        debug!(subscription = id.0, ?patterns, "New subscription");
        self.subscriptions
            .insert(id, Subscription { listener, patterns });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Publish an event to every listener with a matching pattern.
    ///
    /// Returns the number of listeners notified.
    pub fn publish(&self, event: Event) -> usize {
        // Collect first so listeners may (un)subscribe without deadlocking
        let listeners: Vec<Arc<dyn EventListener>> = self
            .subscriptions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .patterns
                    .iter()
                    .any(|p| topic_matches(event.topic(), p))
            })
            .map(|entry| Arc::clone(&entry.value().listener))
            .collect();

        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                warn!(topic = event.topic(), event_id = event.event_id(), "Event listener panicked");
            }
        }

        self.total_published.fetch_add(1, Ordering::Relaxed);
        trace!(
            topic = event.topic(),
            event_id = event.event_id(),
            notified = listeners.len(),
            "Published event"
        );

        listeners.len()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_published: self.total_published.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusStats {
    pub total_published: u64,
    pub subscriptions: usize,
}

/// Check if a topic matches a pattern (MQTT-style wildcards)
///
///   topic: "devices/zwave/node-7"
///   pattern: "devices/+/node-7" -> matches (+ is exactly one level)
///   pattern: "devices/#"        -> matches (# is the rest, possibly empty)
///   pattern: "devices/z*/+"     -> matches (* globs within one level)
///   pattern: "*"                -> matches everything
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == "#" {
        return true;
    }

    let mut levels = topic.split('/');
    for filter in pattern.split('/') {
        if filter == "#" {
            return true;
        }
        let Some(level) = levels.next() else {
            return false;
        };
        let matched = match filter {
            "+" => true,
            glob if glob.contains(['*', '?']) => WildMatch::new(glob).matches(level),
            exact => exact == level,
        };
        if !matched {
            return false;
        }
    }
    levels.next().is_none()
}
