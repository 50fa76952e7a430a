//! Status and message listener registries.
//!
//! Listeners are invoked outside every internal lock. A panic inside one
//! listener is caught and logged; later listeners still run.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned when registering a listener; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// An ordered set of listeners of one kind.
pub(crate) struct ListenerSet<F: ?Sized> {
    listeners: Vec<(ListenerId, Arc<F>)>,
}

impl<F: ?Sized> Default for ListenerSet<F> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<F: ?Sized> ListenerSet<F> {
    pub(crate) fn add(&mut self, listener: Arc<F>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn clear(&mut self) {
        self.listeners.clear();
    }

    /// Copy of the current listeners in registration order, so they can be
    /// called after the owning lock is released.
    pub(crate) fn snapshot(&self) -> Vec<(ListenerId, Arc<F>)> {
        self.listeners.clone()
    }
}

/// Call every listener, isolating panics.
///
/// Returns how many listeners panicked.
pub(crate) fn notify_all<F, A>(
    listeners: &[(ListenerId, Arc<F>)],
    kind: &'static str,
    call: A,
) -> u64
where
    F: ?Sized,
    A: Fn(&F),
{
    let mut failures = 0;
    for (id, listener) in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| call(&**listener)));
        if let Err(panic) = outcome {
            failures += 1;
            tracing::warn!(
                listener = %id,
                kind,
                error = panic_message(panic.as_ref()),
                "listener panicked; continuing with remaining listeners"
            );
        }
    }
    failures
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Listener = dyn Fn(u32) + Send + Sync;

    #[test]
    fn ids_are_unique() {
        let mut set: ListenerSet<Listener> = ListenerSet::default();
        let a = set.add(Arc::new(|_| {}));
        let b = set.add(Arc::new(|_| {}));
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn remove_only_named_listener() {
        let mut set: ListenerSet<Listener> = ListenerSet::default();
        let a = set.add(Arc::new(|_| {}));
        let _b = set.add(Arc::new(|_| {}));

        assert!(set.remove(a));
        assert!(!set.remove(a));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn panicking_listener_does_not_block_later_ones() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let mut set: ListenerSet<Listener> = ListenerSet::default();

        set.add(Arc::new(|_| panic!("listener blew up")));
        let counter = Arc::clone(&delivered);
        set.add(Arc::new(move |value| {
            counter.fetch_add(value as usize, Ordering::SeqCst);
        }));

        let failures = notify_all(&set.snapshot(), "test", |listener| listener(7));

        assert_eq!(failures, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut set: ListenerSet<Listener> = ListenerSet::default();
        for n in 0..3u32 {
            let order = Arc::clone(&order);
            set.add(Arc::new(move |_| order.lock().unwrap().push(n)));
        }

        notify_all(&set.snapshot(), "test", |listener| listener(0));

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
