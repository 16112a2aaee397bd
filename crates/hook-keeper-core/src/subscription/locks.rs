//! Per-key async mutual exclusion.
//!
//! Callers serialize read-modify-write sequences against external systems
//! per key (for example per `(provider, scope)`) while unrelated keys proceed
//! in parallel. Entries are dropped once no holder or waiter remains, so the
//! lock table only holds keys that are in use.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable<K> = Arc<StdMutex<HashMap<K, Arc<Mutex<()>>>>>;

/// Table of async locks keyed by `K`
#[derive(Debug)]
pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: LockTable<K>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty lock table
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`
    ///
    /// The returned guard releases the lock when dropped.
    ///
    /// ```rust
    /// use hook_keeper_core::subscription::KeyedLocks;
    ///
    /// # tokio_test::block_on(async {
    /// let locks = KeyedLocks::new();
    /// let guard = locks.acquire(&"gh/acme/widgets".to_string()).await;
    /// assert_eq!(locks.active_keys(), 1);
    /// drop(guard);
    /// assert_eq!(locks.active_keys(), 0);
    /// # });
    /// ```
    pub async fn acquire(&self, key: &K) -> KeyedGuard<K> {
        let entry = {
            let mut table = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            table
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = entry.lock_owned().await;

        KeyedGuard {
            key: key.clone(),
            table: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited
    pub fn active_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on one key of a [`KeyedLocks`] table
pub struct KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    table: LockTable<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        self.guard.take();

        // Table reference only: nobody holds or waits on this key.
        if let Some(entry) = table.get(&self.key) {
            if Arc::strong_count(entry) == 1 {
                table.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
#[path = "locks_tests.rs"]
mod tests;
