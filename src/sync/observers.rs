//! Listener registry with token-based unsubscribe.
//!
//! Callbacks are snapshotted before each notification so a listener may
//! subscribe or unsubscribe (itself included) while being invoked. A listener
//! that panics is logged and skipped; the rest still run.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct ObserverRegistry<T> {
    name: &'static str,
    listeners: Mutex<BTreeMap<SubscriptionId, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> ObserverRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, Arc::new(listener));
        id
    }

    /// Returns false if the handle was unknown or already removed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Invoke every listener registered at the time of the call
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<(SubscriptionId, Listener<T>)> = self
            .lock()
            .iter()
            .map(|(id, f)| (*id, Arc::clone(f)))
            .collect();

        for (id, listener) in snapshot {
            Self::invoke(self.name, id, &listener, value);
        }
    }

    /// Invoke a single listener, e.g. to replay state right after subscribing
    pub fn notify_one(&self, id: SubscriptionId, value: &T) {
        let listener = self.lock().get(&id).cloned();
        if let Some(listener) = listener {
            Self::invoke(self.name, id, &listener, value);
        }
    }

    fn invoke(name: &str, id: SubscriptionId, listener: &Listener<T>, value: &T) {
        if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
            log::error!("{} listener {:?} panicked; continuing with remaining listeners", name, id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriptionId, Listener<T>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}
