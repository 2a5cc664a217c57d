//! Explicit observer handles.
//!
//! Every observable component (document, presence registry, transports)
//! keeps a [`Subscribers`] registry. Registering a callback returns a
//! [`Subscription`] guard; dropping the guard (or calling
//! [`Subscription::unsubscribe`]) removes the callback.
//!
//! ```text
//! emit(event) ──► snapshot callbacks (read lock) ──► call each, lock released
//! ```
//!
//! Callbacks are invoked outside the lock, so a callback may subscribe or
//! unsubscribe without deadlocking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    callbacks: RwLock<HashMap<u64, Callback<E>>>,
    next_id: AtomicU64,
}

impl<E> Registry<E> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, Callback<E>>> {
        self.callbacks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, Callback<E>>> {
        self.callbacks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A set of callbacks interested in events of type `E`.
pub struct Subscribers<E> {
    registry: Arc<Registry<E>>,
}

impl<E: 'static> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                callbacks: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback. It stays registered while the returned guard lives.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe_arc(Arc::new(callback))
    }

    /// Register an already shared callback.
    pub fn subscribe_arc(&self, callback: Arc<dyn Fn(&E) + Send + Sync>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.write().insert(id, callback);

        let weak: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.write().remove(&id);
                }
            })),
        }
    }

    /// Deliver `event` to every registered callback. Returns how many ran.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Callback<E>> = self.registry.read().values().cloned().collect();
        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for a registered callback.
#[must_use = "dropping a Subscription immediately unsubscribes the callback"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the callback now.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
