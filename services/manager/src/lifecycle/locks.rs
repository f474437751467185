//! Per-key async locks.
//!
//! Lifecycle operations on the same infrastructure are serialized in arrival
//! order; operations on different infrastructures never contend. Entries are
//! removed again once nobody holds or waits for them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

/// Registry of lazily created per-key mutexes.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind earlier holders.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            registry: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds the lock for one key until dropped.
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    registry: &'a KeyedLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        let mut locks = self
            .registry
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // One reference in the map, one held by our guard: nobody is waiting.
        if let Some(mutex) = locks.get(&self.key) {
            if Arc::strong_count(mutex) == 2 {
                locks.remove(&self.key);
            }
        }
        self.guard.take();
    }
}
