//! Event listeners and a copy-on-write listener registry.
//!
//! Listeners are stored in an immutable vector that is swapped on every
//! add/remove. `post` iterates a snapshot, so listeners may be added or
//! removed from inside a callback without deadlocking.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

/// Receives events of type `E`.
pub trait EventListener<E>: Send + Sync {
    /// Whether this listener wants `event`. Defaults to everything.
    fn is_relevant(&self, _event: &E) -> bool {
        true
    }

    fn event(&self, event: &E);
}

impl<E, F> EventListener<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn event(&self, event: &E) {
        self(event)
    }
}

/// Handle returned by [`ListenerRegistry::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listeners<E> = Arc<Vec<(ListenerId, Arc<dyn EventListener<E>>)>>;

/// A set of listeners for one event type.
pub struct ListenerRegistry<E> {
    listeners: RwLock<Listeners<E>>,
    next_id: AtomicU64,
}

impl<E> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<E>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write().expect("listener lock poisoned");
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    /// Remove a listener. Returns `false` (and warns) if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().expect("listener lock poisoned");
        if !guard.iter().any(|(lid, _)| *lid == id) {
            warn!(listener = id.0, "attempted to remove unknown listener");
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|(lid, _)| *lid != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every relevant listener.
    ///
    /// A listener that panics is logged and skipped; delivery to the rest
    /// continues.
    pub fn post(&self, event: &E) {
        for (id, listener) in self.snapshot().iter() {
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                if listener.is_relevant(event) {
                    listener.event(event);
                }
            }));
            if delivered.is_err() {
                warn!(listener = id.0, "event listener panicked");
            }
        }
    }

    fn snapshot(&self) -> Listeners<E> {
        self.listeners
            .read()
            .expect("listener lock poisoned")
            .clone()
    }
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn post_reaches_all_listeners() {
        let registry = ListenerRegistry::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        registry.add_listener(Arc::new(move |e: &u32| s1.lock().unwrap().push(("a", *e))));
        let s2 = seen.clone();
        registry.add_listener(Arc::new(move |e: &u32| s2.lock().unwrap().push(("b", *e))));

        registry.post(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn remove_is_reported() {
        let registry = ListenerRegistry::<u32>::new();
        let id = registry.add_listener(Arc::new(|_: &u32| {}));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = ListenerRegistry::<u32>::new();
        let count = Arc::new(AtomicU64::new(0));

        registry.add_listener(Arc::new(|_: &u32| panic!("listener failure")));
        let c = count.clone();
        registry.add_listener(Arc::new(move |_: &u32| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        registry.post(&1);
        registry.post(&2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    struct EvenOnly(Arc<AtomicU64>);

    impl EventListener<u32> for EvenOnly {
        fn is_relevant(&self, event: &u32) -> bool {
            event % 2 == 0
        }

        fn event(&self, _event: &u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn irrelevant_events_are_filtered() {
        let registry = ListenerRegistry::<u32>::new();
        let count = Arc::new(AtomicU64::new(0));
        registry.add_listener(Arc::new(EvenOnly(count.clone())));

        for e in 0..5 {
            registry.post(&e);
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn listener_can_remove_itself_during_post() {
        let registry = Arc::new(ListenerRegistry::<u32>::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let r = Arc::downgrade(&registry);
        let s = slot.clone();
        let id = registry.add_listener(Arc::new(move |_: &u32| {
            if let (Some(reg), Some(id)) = (r.upgrade(), *s.lock().unwrap()) {
                reg.remove_listener(id);
            }
        }));
        *slot.lock().unwrap() = Some(id);

        registry.post(&1);
        assert!(registry.is_empty());
    }
}
