//! Event bus
//!
//! Thread-safe multi-listener notification used to wire the pipeline stages
//! together. Subscribing returns a [`Subscription`]; the listener stays
//! registered exactly as long as that handle is alive.
//!
//! `publish` copies the listener set under the lock and invokes the copy with
//! the lock released, so a listener may subscribe, release or publish on the
//! same bus while it is being called.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    next_id: u64,
    entries: BTreeMap<u64, Listener<T>>,
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Multi-subscriber event channel carrying values of type `T`
///
/// Clones share the same listener set.
pub struct EventBus<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T: 'static> EventBus<T> {
    /// Create a bus with no listeners
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
        }
    }

    /// Register a listener
    ///
    /// The listener is removed when the returned handle is dropped or
    /// released, so the caller must keep it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut listeners = lock(&self.listeners);
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.insert(id, Arc::new(callback));
            id
        };

        let registry: Weak<Mutex<Listeners<T>>> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = registry.upgrade() {
                lock(&listeners).entries.remove(&id);
            }
        })
    }

    /// Invoke every listener subscribed at the time of the call
    ///
    /// A panicking listener is not caught and unwinds into the caller.
    pub fn publish(&self, args: &T) {
        let snapshot: Vec<Listener<T>> = lock(&self.listeners).entries.values().cloned().collect();
        for listener in snapshot {
            listener(args);
        }
    }

    /// Number of currently registered listeners
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).entries.len()
    }
}

impl<T: 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &lock(&self.listeners).entries.len())
            .finish()
    }
}

/// Handle owning one live subscription
///
/// Released exactly once: on [`Subscription::release`] or on drop, whichever
/// comes first. Releasing after the bus itself is gone is a no-op.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle that is not attached to any bus
    pub fn detached() -> Self {
        Self { release: None }
    }

    /// Whether this handle still owns a registration
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Remove the listener now
    pub fn release(mut self) {
        self.disconnect();
    }

    fn disconnect(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
