use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use rocket::tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on first use and dropped once nobody
/// holds or waits for it.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`. Access ends when the guard is dropped.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = self.entry(key);
        lock.lock_owned().await
    }

    /// Wait until every lock currently known is free.
    pub async fn drain(&self) {
        let all: Vec<_> = self.map().values().cloned().collect();
        for lock in all {
            drop(lock.lock().await);
        }
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut map = self.map();
        // A count of one means only the map refers to the lock.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(key.clone()).or_default().clone()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<K, Arc<AsyncMutex<()>>>> {
        // The map is only ever held briefly and without awaiting, so a poisoned map is still consistent.
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
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

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rocket::tokio::{self, time::sleep};

    use super::*;

    #[rocket::async_test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let (locks, inside, max_inside) = (locks.clone(), inside.clone(), max_inside.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&1).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[rocket::async_test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _one = locks.lock(&1).await;
        let two = tokio::time::timeout(Duration::from_millis(100), locks.lock(&2)).await;
        assert!(two.is_ok());
    }

    #[rocket::async_test]
    async fn released_locks_are_forgotten() {
        let locks = KeyedLocks::<u32>::new();
        drop(locks.lock(&1).await);
        let held = locks.lock(&2).await;
        assert_eq!(locks.map().len(), 1);
        assert!(!locks.map().contains_key(&1));

        let _three = locks.lock(&3).await;
        assert_eq!(locks.map().len(), 2);
        assert!(locks.map().contains_key(&2));

        drop(held);
        drop(locks.lock(&4).await);
        assert!(!locks.map().contains_key(&2));
        assert!(locks.map().contains_key(&3));
    }
}
