//! Ordered, keyed listener registry shared by every subscribe-style API.
//!
//! Listeners for one key are invoked in registration order. Registration
//! returns a [`Subscription`] guard; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes exactly that listener, and the
//! key's listener set is deleted once it becomes empty.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::warn;

/// Shared callback invoked with a borrowed event.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerEntry<T: ?Sized> {
    id: u64,
    callback: Listener<T>,
}

/// Keyed listener sets with stable per-key ordering.
pub(crate) struct ListenerMap<K, T: ?Sized> {
    entries: Mutex<HashMap<K, Vec<ListenerEntry<T>>>>,
    next_id: AtomicU64,
}

impl<K, T> ListenerMap<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: ?Sized + 'static,
{
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register `callback` under `key`.
    pub(crate) fn add(self: &Arc<Self>, key: K, callback: Listener<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .entry(key.clone())
            .or_default()
            .push(ListenerEntry { id, callback });

        let map: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(map) = map.upgrade() {
                map.remove(&key, id);
            }
        })
    }

    /// Remove one listener; deletes the key when it was the last one.
    pub(crate) fn remove(&self, key: &K, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let Some(listeners) = entries.get_mut(key) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            entries.remove(key);
        }
        removed
    }

    /// Remove every listener registered under `key`.
    pub(crate) fn remove_all(&self, key: &K) -> usize {
        self.entries
            .lock()
            .remove(key)
            .map_or(0, |listeners| listeners.len())
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub(crate) fn count(&self, key: &K) -> usize {
        self.entries.lock().get(key).map_or(0, Vec::len)
    }

    /// Invoke every listener for `key` with `value`, in registration order.
    ///
    /// The listener list is snapshotted first so callbacks may subscribe or
    /// unsubscribe without deadlocking. Returns the number of listeners that
    /// completed without panicking.
    pub(crate) fn emit(&self, key: &K, value: &T) -> usize {
        let snapshot: Vec<Listener<T>> = match self.entries.lock().get(key) {
            Some(listeners) => listeners
                .iter()
                .map(|entry| Arc::clone(&entry.callback))
                .collect(),
            None => return 0,
        };

        snapshot
            .iter()
            .filter(|callback| invoke_isolated(callback, value))
            .count()
    }
}

/// Run one listener, containing any panic it raises.
pub(crate) fn invoke_isolated<T: ?Sized>(callback: &Listener<T>, value: &T) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
        Ok(()) => true,
        Err(_) => {
            warn!("Listener panicked; continuing delivery to remaining listeners");
            false
        }
    }
}

/// Guard for a registered listener.
///
/// The listener stays registered for as long as the guard lives.
#[must_use = "dropping a Subscription immediately removes its listener"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
