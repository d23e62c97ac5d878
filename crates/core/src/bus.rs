//! Thread-safe notification bus.
//!
//! Subscribing hands back a [`SubscriptionId`]; removing it is a separate
//! call. A callback is a required argument, so there is no way to register
//! "nothing" or to unsubscribe by passing an empty callback.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type Callback<T> = dyn Fn(&T) -> anyhow::Result<()> + Send + Sync;

/// Handle returned by [`NotificationBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry<T> {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    callback: Arc<Callback<T>>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: Arc::clone(&self.active),
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Ordered set of subscriptions for events of type `T`.
pub struct NotificationBus<T> {
    name: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T> NotificationBus<T> {
    pub fn new(name: &'static str) -> Self {
        Self { name, next_id: AtomicU64::new(1), entries: Mutex::new(Vec::new()) }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Entry {
            id,
            active: Arc::new(AtomicBool::new(true)),
            callback: Arc::new(callback),
        });
        tracing::debug!(target: "bus", bus = self.name, id = id.0, "subscribed");
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.lock();
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = entries.remove(pos);
        // A notify pass that already snapshotted this entry skips it from now on.
        entry.active.store(false, Ordering::SeqCst);
        tracing::debug!(target: "bus", bus = self.name, id = id.0, "unsubscribed");
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every active subscription once, in subscription order.
    ///
    /// The list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe re-entrantly. A callback that errors or panics is logged
    /// and the rest still run. Returns the number of callbacks invoked.
    pub fn notify(&self, event: &T) -> usize {
        let snapshot: Vec<Entry<T>> = self.lock().clone();
        let mut delivered = 0;
        for entry in snapshot {
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }
            delivered += 1;
            let callback = &entry.callback;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(target: "bus", bus = self.name, id = entry.id.0, error = %e, "subscriber failed");
                }
                Err(_) => {
                    tracing::error!(target: "bus", bus = self.name, id = entry.id.0, "subscriber panicked");
                }
            }
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Unsubscribes on drop. Lets a run guarantee teardown on every exit path.
pub struct SubscriptionGuard<'a, T> {
    bus: &'a NotificationBus<T>,
    id: SubscriptionId,
}

impl<'a, T> SubscriptionGuard<'a, T> {
    pub fn new(bus: &'a NotificationBus<T>, id: SubscriptionId) -> Self {
        Self { bus, id }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl<T> Drop for SubscriptionGuard<'_, T> {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
