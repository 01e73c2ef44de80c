use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots<K> = DashMap<K, Arc<Mutex<()>>>;

/// Lock table keyed by tenant (or any key). Holding the guard excludes other
/// holders of the same key only. A key's slot is dropped from the table once
/// its last guard is released.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    locks: Arc<Slots<K>>,
}

/// Held lock on one key
pub struct KeyGuard<K: Eq + Hash + Clone> {
    key: K,
    locks: Arc<Slots<K>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table still references an idle slot
        self.locks
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire without waiting. `None` when the key is already held.
    pub fn try_acquire(&self, key: &K) -> Option<KeyGuard<K>> {
        let guard = self.slot(key).try_lock_owned().ok()?;
        Some(KeyGuard {
            key: key.clone(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        })
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .map_or(false, |m| m.try_lock().is_err())
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
