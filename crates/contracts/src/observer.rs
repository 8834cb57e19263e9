//! ObserverRegistry - ordered callback list owned by a publisher
//!
//! Every `subscribe` returns a handle that must be passed back to
//! `unsubscribe` when the subscriber is torn down. Callbacks run in
//! subscription order on the publishing thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct ObserverRegistry<E> {
    next_id: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Default for ObserverRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ObserverRegistry<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
        }
    }

    fn observers(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Callback<E>)>> {
        // a panicking callback cannot corrupt the list itself
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers().push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` for unknown or already removed handles
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    /// Invoke every observer in subscription order.
    ///
    /// The list is snapshotted first, so callbacks may (un)subscribe.
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .observers()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn clear(&self) {
        self.observers().clear();
    }

    pub fn len(&self) -> usize {
        self.observers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> std::fmt::Debug for ObserverRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_in_subscription_order() {
        let registry = ObserverRegistry::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            registry.subscribe(move |e| log.lock().unwrap().push(format!("{tag}{e}")));
        }
        registry.notify(&1);
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_unsubscribe_is_symmetric() {
        let registry = ObserverRegistry::<()>::new();
        let id = registry.subscribe(|_| {});
        assert_eq!(registry.len(), 1);
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let registry = Arc::new(ObserverRegistry::<()>::new());
        let slot = Arc::new(Mutex::new(None));
        let inner_registry = Arc::clone(&registry);
        let inner_slot = Arc::clone(&slot);
        let id = registry.subscribe(move |_| {
            if let Some(id) = inner_slot.lock().unwrap().take() {
                inner_registry.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        registry.notify(&());
        assert!(registry.is_empty());
    }
}
