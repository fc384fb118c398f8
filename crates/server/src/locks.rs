//! Per-database build locks.
//!
//! Two requests for the same connection and scenario would otherwise race on
//! the same database name. Different scenarios build concurrently. An entry
//! lives only while someone holds or waits for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockKey = (String, String);
type LockMap = Arc<Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>>;

#[derive(Debug, Default, Clone)]
pub struct BuildLocks {
    inner: LockMap,
}

impl BuildLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock of `(connection, scenario_hash)`.
    pub async fn acquire(&self, connection: &str, scenario_hash: &str) -> BuildGuard {
        let key = (connection.to_string(), scenario_hash.to_string());
        let lock = lock_map(&self.inner).entry(key.clone()).or_default().clone();
        // Declared before the await so a cancelled wait still cleans up.
        let mut pending = BuildGuard { key, map: Arc::clone(&self.inner), guard: None };
        pending.guard = Some(lock.lock_owned().await);
        pending
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        lock_map(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock; dropping it releases the key and forgets it once nobody waits.
#[derive(Debug)]
pub struct BuildGuard {
    key: LockKey,
    map: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = lock_map(&self.map);
        if map.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&self.key);
        }
    }
}

fn lock_map(map: &LockMap) -> MutexGuard<'_, HashMap<LockKey, Arc<AsyncMutex<()>>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
