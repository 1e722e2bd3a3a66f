//! Time-boxed key/value store backing call memoization.
//!
//! Entries are valid while `now - stored_at < ttl` and are never evicted on
//! their own: an expired entry stays in memory until it is overwritten,
//! removed, or swept by [`CacheStore::purge_expired`]. For a single client
//! session the key space is small and bounded by the set of call sites, so
//! the store does not cap its size.

use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tracing::trace;

/// Default time-to-live for cached values.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// A cached value with its storage time and lifetime.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    /// Create an entry stored now.
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// Whether the entry is still valid at `now`.
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn stored_at(&self) -> Instant {
        self.stored_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Concurrent TTL cache keyed by opaque strings.
pub struct CacheStore<T> {
    entries: scc::HashMap<String, CacheEntry<T>>,
    default_ttl: Duration,
}

impl<T> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl<T> CacheStore<T> {
    /// Create a store whose `set` uses `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: scc::HashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store `value` under `key` with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: T) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let mut pending = (key.into(), CacheEntry::new(value, ttl));
        loop {
            let (key, entry) = match self.entries.insert_sync(pending.0, pending.1) {
                Ok(()) => return,
                Err(rejected) => rejected,
            };

            let mut slot = Some(entry);
            let replaced = self
                .entries
                .update_sync(&key, |_, current| {
                    if let Some(entry) = slot.take() {
                        *current = entry;
                    }
                })
                .is_some();
            if replaced {
                return;
            }

            // Removed between the failed insert and the update.
            let Some(entry) = slot.take() else {
                return;
            };
            pending = (key, entry);
        }
    }

    /// Remove `key`. Returns whether an entry existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove_sync(key).is_some()
    }

    /// Whether a valid entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .update_sync(key, |_, entry| entry.is_valid_at(now))
            .unwrap_or(false)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear_sync();
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain_sync(|_, entry| entry.is_valid_at(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            trace!(purged, "Purged expired cache entries");
        }
        purged
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> CacheStore<T> {
    /// Return the value for `key` if present and not expired.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        self.entries
            .update_sync(key, |_, entry| {
                entry.is_valid_at(now).then(|| entry.value.clone())
            })
            .flatten()
    }

    /// Return the cached value for `key`, or run `fetch` and cache its
    /// successful result with the default TTL.
    ///
    /// Failures are returned unchanged and never cached.
    pub async fn get_or_fetch<E, F, Fut>(&self, key: &str, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key) {
            trace!(key, "Cache hit");
            return Ok(hit);
        }
        let value = fetch().await?;
        self.set(key, value.clone());
        Ok(value)
    }
}
