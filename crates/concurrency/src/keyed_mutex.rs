//! Per-key mutex registry (in-process serialization).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily creates one async mutex per key.
///
/// Collapses concurrent operations on the same product into a serial sequence
/// inside one process, which avoids wasted optimistic retries. It gives no
/// guarantee across processes; the version-gated write stays the correctness
/// mechanism.
#[derive(Debug, Default)]
pub struct KeyedMutexRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedMutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the mutex for `key`, creating it on first use.
    ///
    /// Repeated calls with the same key return the same instance.
    pub fn acquire(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.acquire(key).lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop mutexes nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        // The registry's own Arc is the only reference left for idle keys.
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn same_key_returns_same_instance() {
        let registry = KeyedMutexRegistry::new();
        let a = registry.acquire("product-1");
        let b = registry.acquire("product-1");
        let c = registry.acquire("product-2");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_critical_sections_do_not_overlap() {
        let registry = Arc::new(KeyedMutexRegistry::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                tokio::spawn(async move {
                    let _guard = registry.lock("sku-42").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let registry = KeyedMutexRegistry::new();
        let _a = registry.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), registry.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn prune_keeps_held_mutexes() {
        let registry = KeyedMutexRegistry::new();
        let held = registry.lock("held").await;
        let _ = registry.acquire("idle");

        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 1);

        drop(held);
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }
}
