use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tracing::error;

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Event name to handlers, in registration order.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Handler)>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, event: &str, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn remove(&self, event: &str, id: u64) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };

        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    /// Calls every handler of `event`. Handlers run outside the lock, so
    /// they may subscribe or unsubscribe; a panicking handler is logged and
    /// the rest still run.
    pub fn emit(&self, event: &str, payload: &Value) {
        let snapshot: Vec<Handler> = match self.lock().get(event) {
            Some(list) => list.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
            None => return,
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!(event, "event handler panicked");
            }
        }
    }
}

/// Handle to one registered handler.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    registry: Weak<Registry>,
    event: String,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(registry: &Arc<Registry>, event: &str, id: u64) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            event: event.to_string(),
            id,
        }
    }

    /// Removes the handler. Returns false when it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(&self.event, self.id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn counter(registry: &Registry, event: &str) -> (Arc<AtomicUsize>, u64) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = registry.add(
            event,
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (calls, id)
    }

    #[test]
    fn panicking_handler_does_not_stop_fan_out() {
        let registry = Registry::default();
        registry.add("order_status_updated", Arc::new(|_| panic!("boom")));
        let (calls, _) = counter(&registry, "order_status_updated");

        registry.emit("order_status_updated", &json!({"status": "accepted"}));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_handler_is_not_called() {
        let registry = Registry::default();
        let (calls, id) = counter(&registry, "rider_location");

        assert!(registry.remove("rider_location", id));
        assert!(!registry.remove("rider_location", id));
        registry.emit("rider_location", &Value::Null);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.handler_count("rider_location"), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself_while_running() {
        let registry = Arc::new(Registry::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let handler_slot = Arc::clone(&slot);
        let seen = Arc::clone(&calls);
        let id = registry.add(
            "connected",
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                if let Some(subscription) = handler_slot.lock().unwrap().take() {
                    subscription.unsubscribe();
                }
            }),
        );
        *slot.lock().unwrap() = Some(Subscription::new(&registry, "connected", id));

        registry.emit("connected", &Value::Null);
        registry.emit("connected", &Value::Null);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
