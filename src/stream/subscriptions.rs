//! Subscription registry mapping subscription ids to event handlers.
//!
//! The registry is owned by the stream client and outlives any single
//! physical connection, which lets the connection worker re-establish
//! subscriptions after a reconnect using the stored filters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::envelope::SubscriptionId;

type EventHandler = Arc<Mutex<dyn FnMut(Value) + Send>>;

struct SubscriptionEntry {
    filter: Value,
    handler: EventHandler,
}

/// Routes inbound push events to caller-supplied handlers by subscription id.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionId, SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `on_event` under `id`, replacing any previous handler.
    ///
    /// The filter is kept so the connection worker can resubscribe with it
    /// after a reconnect.
    pub fn insert<F>(&self, id: SubscriptionId, filter: Value, on_event: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                id,
                SubscriptionEntry {
                    filter,
                    handler: Arc::new(Mutex::new(on_event)),
                },
            );
        }
    }

    /// Removes the handler for `id` and reports whether one was present.
    ///
    /// Idempotent: removing an unknown or already-removed id returns `false`
    /// and has no other effect.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.entries
            .lock()
            .map(|mut entries| entries.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Invokes the handler registered for `id` with `event`, exactly once.
    ///
    /// Events for unknown ids (never registered, already unsubscribed, or
    /// issued by a previous connection generation) are silently discarded.
    pub fn dispatch(&self, id: SubscriptionId, event: Value) {
        let handler = self
            .entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&id).map(|entry| Arc::clone(&entry.handler)));

        match handler {
            Some(handler) => {
                if let Ok(mut handler) = handler.lock() {
                    (&mut *handler)(event);
                }
            }
            None => {
                debug!(event = "subscription_event_dropped", subscription = id);
            }
        }
    }

    /// Snapshot of all active ids and their filters, for resubscription.
    pub fn snapshot(&self) -> Vec<(SubscriptionId, Value)> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .map(|(id, entry)| (*id, entry.filter.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Moves the entry for `old` under `new`, keeping filter and handler.
    ///
    /// Returns `false` when `old` is no longer registered (unsubscribed while
    /// the reconnect was in flight).
    pub fn rebind(&self, old: SubscriptionId, new: SubscriptionId) -> bool {
        self.entries
            .lock()
            .map(|mut entries| match entries.remove(&old) {
                Some(entry) => {
                    entries.insert(new, entry);
                    true
                }
                None => false,
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::SubscriptionRegistry;

    fn counting_handler() -> (Arc<AtomicUsize>, impl FnMut(serde_json::Value) + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        let handler = move |_event| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
        };
        (calls, handler)
    }

    #[test]
    fn dispatch_invokes_registered_handler_exactly_once() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        registry.insert(7, json!({"kind": "all"}), move |event| {
            if let Ok(mut seen) = seen_in_handler.lock() {
                seen.push(event);
            }
        });

        registry.dispatch(7, json!({"seq": 1}));

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.as_slice(), &[json!({"seq": 1})]);
    }

    #[test]
    fn dispatch_for_unknown_id_invokes_nothing() {
        let registry = SubscriptionRegistry::new();
        let (calls, handler) = counting_handler();
        registry.insert(1, json!(null), handler);

        registry.dispatch(2, json!({"seq": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatch_after_unsubscribe_invokes_nothing() {
        let registry = SubscriptionRegistry::new();
        let (calls, handler) = counting_handler();
        registry.insert(3, json!(null), handler);

        assert!(registry.remove(3));
        registry.dispatch(3, json!({"seq": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_of_never_registered_id_returns_false() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.remove(42));
        // Removing twice is a no-op as well.
        let (_, handler) = counting_handler();
        registry.insert(42, json!(null), handler);
        assert!(registry.remove(42));
        assert!(!registry.remove(42));
    }

    #[test]
    fn rebind_moves_handler_to_new_id() {
        let registry = SubscriptionRegistry::new();
        let (calls, handler) = counting_handler();
        registry.insert(5, json!({"filter": 1}), handler);

        assert!(registry.rebind(5, 99));
        registry.dispatch(5, json!({"seq": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        registry.dispatch(99, json!({"seq": 2}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rebind_of_unsubscribed_id_returns_false() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.rebind(1, 2));
    }

    #[test]
    fn snapshot_reports_stored_filters() {
        let registry = SubscriptionRegistry::new();
        let (_, handler) = counting_handler();
        registry.insert(8, json!({"sender": "0x2"}), handler);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot, vec![(8, json!({"sender": "0x2"}))]);
    }
}
