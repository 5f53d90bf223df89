//! Per-correlation-key lock registry.
//!
//! One async mutex per key, created lazily on first use. Entries are never
//! removed mid-flight: removing a lock another task may be about to acquire
//! reintroduces the lock-acquired-then-deleted race the registry exists to
//! prevent. Lifetime is bounded by active correlation identities.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use collate_core::CorrelationKey;

/// Arena-style map from correlation key to a shared lock handle.
///
/// All mutations to a single group -- from producer tasks and the reaper --
/// are totally ordered by the key's lock. There is no ordering across keys.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<CorrelationKey, Arc<Mutex<()>>>,
}

impl LockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Returns the lock handle for a key, creating it on first use.
    #[must_use]
    pub fn obtain(&self, key: &CorrelationKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Probes whether the key's lock is currently held.
    ///
    /// Test and diagnostic aid; the result is stale the moment it returns.
    #[must_use]
    pub fn is_locked(&self, key: &CorrelationKey) -> bool {
        match self.locks.get(key) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// Number of keys with a registered lock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no lock has been registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn obtain_returns_the_same_lock_for_the_same_key() {
        let registry = LockRegistry::new();
        let a = registry.obtain(&"ABC".into());
        let b = registry.obtain(&"ABC".into());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn different_keys_get_independent_locks() {
        let registry = LockRegistry::new();
        let a = registry.obtain(&"A".into());
        let b = registry.obtain(&"B".into());

        // Holding A must not block B.
        let _guard = a.lock().await;
        let acquired = tokio::time::timeout(std::time::Duration::from_millis(50), b.lock()).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn is_locked_reflects_held_state() {
        let registry = LockRegistry::new();
        let key: CorrelationKey = "ABC".into();
        assert!(!registry.is_locked(&key));

        let lock = registry.obtain(&key);
        {
            let _guard = lock.lock().await;
            assert!(registry.is_locked(&key));
        }
        assert!(!registry.is_locked(&key));
    }

    #[tokio::test]
    async fn lock_serializes_concurrent_tasks() {
        let registry = Arc::new(LockRegistry::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let lock = registry.obtain(&"shared".into());
                let _guard = lock.lock().await;
                // Non-atomic read-modify-write protected by the lock.
                let seen = counter.load(std::sync::atomic::Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(seen + 1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 8);
    }
}
