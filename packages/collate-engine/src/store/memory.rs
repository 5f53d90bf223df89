//! In-memory [`MessageGroupStore`] backed by [`DashMap`].
//!
//! The default store. Provides concurrent access without external locking;
//! expiry sweeps iterate a snapshot so groups can be mutated while a sweep
//! is in flight. Timestamps come from a shared [`MonotonicClock`] so group
//! creation times are unique and `last_modified` never regresses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use collate_core::{CorrelationKey, Message, MessageGroup, MessageId, MonotonicClock};

use crate::error::StoreError;
use crate::store::{GroupExpiryCallback, MessageGroupStore};

/// In-memory group store with an optional per-group capacity bound.
pub struct SimpleMessageGroupStore {
    groups: DashMap<CorrelationKey, MessageGroup>,
    callbacks: RwLock<Vec<Arc<dyn GroupExpiryCallback>>>,
    clock: MonotonicClock,
    capacity_per_group: Option<usize>,
}

impl SimpleMessageGroupStore {
    /// Creates an unbounded store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::system())
    }

    /// Creates an unbounded store on the given clock.
    ///
    /// Sharing one clock between the store and the engine keeps expiry age
    /// arithmetic on a single time base.
    #[must_use]
    pub fn with_clock(clock: MonotonicClock) -> Self {
        Self {
            groups: DashMap::new(),
            callbacks: RwLock::new(Vec::new()),
            clock,
            capacity_per_group: None,
        }
    }

    /// Bounds each group to at most `capacity` buffered messages.
    #[must_use]
    pub fn with_capacity_per_group(mut self, capacity: usize) -> Self {
        self.capacity_per_group = Some(capacity);
        self
    }

    /// The clock this store stamps groups with.
    #[must_use]
    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    fn snapshot_older_than(&self, older_than: Duration) -> Vec<MessageGroup> {
        let now = self.clock.now_millis();
        let threshold = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        self.groups
            .iter()
            .filter(|entry| now - entry.value().last_modified() > threshold)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for SimpleMessageGroupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageGroupStore for SimpleMessageGroupStore {
    async fn add_message_to_group(
        &self,
        key: &CorrelationKey,
        message: Message,
    ) -> Result<MessageGroup, StoreError> {
        let now = self.clock.now_millis();
        let mut entry = self
            .groups
            .entry(key.clone())
            .or_insert_with(|| MessageGroup::new(key.clone(), now));
        let group = entry.value_mut();

        if group.is_complete() {
            return Err(StoreError::CompletedGroupMutation { key: key.clone() });
        }
        if let Some(capacity) = self.capacity_per_group {
            if group.size() >= capacity {
                return Err(StoreError::CapacityExceeded {
                    key: key.clone(),
                    capacity,
                });
            }
        }

        group.add(message)?;
        group.set_last_modified(now);
        Ok(group.clone())
    }

    async fn get_message_group(
        &self,
        key: &CorrelationKey,
    ) -> Result<MessageGroup, StoreError> {
        match self.groups.get(key) {
            Some(entry) => Ok(entry.value().clone()),
            None => Ok(MessageGroup::new(key.clone(), self.clock.now_millis())),
        }
    }

    async fn remove_messages_from_group(
        &self,
        key: &CorrelationKey,
        message_ids: &[MessageId],
    ) -> Result<MessageGroup, StoreError> {
        match self.groups.get_mut(key) {
            Some(mut entry) => {
                let group = entry.value_mut();
                for id in message_ids {
                    group.remove(*id);
                }
                group.set_last_modified(self.clock.now_millis());
                Ok(group.clone())
            }
            None => Ok(MessageGroup::new(key.clone(), self.clock.now_millis())),
        }
    }

    async fn remove_message_group(&self, key: &CorrelationKey) -> Result<(), StoreError> {
        match self.groups.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::GroupNotFound { key: key.clone() }),
        }
    }

    async fn complete_group(&self, key: &CorrelationKey) -> Result<(), StoreError> {
        match self.groups.get_mut(key) {
            Some(mut entry) => {
                let group = entry.value_mut();
                group.mark_complete();
                group.set_last_modified(self.clock.now_millis());
                Ok(())
            }
            None => Err(StoreError::GroupNotFound { key: key.clone() }),
        }
    }

    async fn set_last_released_sequence(
        &self,
        key: &CorrelationKey,
        sequence_number: u32,
    ) -> Result<(), StoreError> {
        if let Some(mut entry) = self.groups.get_mut(key) {
            let group = entry.value_mut();
            group.set_last_released_sequence(sequence_number);
            group.set_last_modified(self.clock.now_millis());
        }
        Ok(())
    }

    async fn expire_message_groups(&self, older_than: Duration) -> Result<usize, StoreError> {
        let candidates = self.snapshot_older_than(older_than);
        if candidates.is_empty() {
            return Ok(0);
        }

        // The guard must not be held across the awaits below.
        let callbacks: Vec<Arc<dyn GroupExpiryCallback>> = self.callbacks.read().clone();

        let mut processed = 0;
        for group in candidates {
            for callback in &callbacks {
                if let Err(error) = callback.on_expiry(group.clone()).await {
                    tracing::warn!(
                        group_id = %group.group_id(),
                        %error,
                        "expiry callback failed; will retry on the next sweep"
                    );
                }
            }
            processed += 1;
        }
        Ok(processed)
    }

    fn register_expiry_callback(&self, callback: Arc<dyn GroupExpiryCallback>) {
        self.callbacks.write().push(callback);
    }

    fn message_group_count(&self) -> usize {
        self.groups.len()
    }

    fn message_count_for_group(&self, key: &CorrelationKey) -> usize {
        self.groups.get(key).map_or(0, |entry| entry.value().size())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use collate_core::{ClockSource, ManualClock};

    use super::*;

    fn message(payload: i64) -> Message {
        Message::builder().payload(json!(payload)).correlation_id("ABC").build()
    }

    fn manual_store(start_millis: i64) -> (SimpleMessageGroupStore, Arc<ManualClock>) {
        let source = Arc::new(ManualClock::new(start_millis));
        let clock = MonotonicClock::with_source(Arc::clone(&source) as Arc<dyn ClockSource>);
        (SimpleMessageGroupStore::with_clock(clock), source)
    }

    #[tokio::test]
    async fn add_then_get_round_trips_the_message() {
        let store = SimpleMessageGroupStore::new();
        let key: CorrelationKey = "ABC".into();
        let msg = message(1);

        let added = store.add_message_to_group(&key, msg.clone()).await.unwrap();
        assert_eq!(added.size(), 1);

        let fetched = store.get_message_group(&key).await.unwrap();
        assert_eq!(fetched.messages(), &[msg]);
        assert!(fetched.last_modified() >= fetched.timestamp());
    }

    #[tokio::test]
    async fn get_returns_a_snapshot_not_a_live_view() {
        let store = SimpleMessageGroupStore::new();
        let key: CorrelationKey = "ABC".into();
        store.add_message_to_group(&key, message(1)).await.unwrap();

        let snapshot = store.get_message_group(&key).await.unwrap();
        store.add_message_to_group(&key, message(2)).await.unwrap();

        assert_eq!(snapshot.size(), 1, "snapshot must not see later mutations");
        assert_eq!(store.message_count_for_group(&key), 2);
    }

    #[tokio::test]
    async fn unknown_key_reads_as_an_empty_group() {
        let store = SimpleMessageGroupStore::new();
        let group = store.get_message_group(&"missing".into()).await.unwrap();
        assert!(group.is_empty());
        assert!(!group.is_complete());
        assert_eq!(store.message_group_count(), 0);
    }

    #[tokio::test]
    async fn remove_message_group_fails_loudly_for_unknown_keys() {
        let store = SimpleMessageGroupStore::new();
        let err = store.remove_message_group(&"missing".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::GroupNotFound { .. }));
    }

    #[tokio::test]
    async fn completed_group_rejects_additions() {
        let store = SimpleMessageGroupStore::new();
        let key: CorrelationKey = "ABC".into();
        store.add_message_to_group(&key, message(1)).await.unwrap();
        store.complete_group(&key).await.unwrap();

        let err = store.add_message_to_group(&key, message(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::CompletedGroupMutation { .. }));
        assert_eq!(store.message_count_for_group(&key), 1);
    }

    #[tokio::test]
    async fn duplicate_message_identity_is_rejected() {
        let store = SimpleMessageGroupStore::new();
        let key: CorrelationKey = "ABC".into();
        let msg = message(1);
        store.add_message_to_group(&key, msg.clone()).await.unwrap();

        let err = store.add_message_to_group(&key, msg).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn capacity_bound_is_enforced() {
        let store = SimpleMessageGroupStore::new().with_capacity_per_group(2);
        let key: CorrelationKey = "ABC".into();
        store.add_message_to_group(&key, message(1)).await.unwrap();
        store.add_message_to_group(&key, message(2)).await.unwrap();

        let err = store.add_message_to_group(&key, message(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { capacity: 2, .. }));
        assert_eq!(store.message_count_for_group(&key), 2);
    }

    #[tokio::test]
    async fn remove_messages_ignores_absent_ids() {
        let store = SimpleMessageGroupStore::new();
        let key: CorrelationKey = "ABC".into();
        let keep = message(1);
        let gone = message(2);
        store.add_message_to_group(&key, keep.clone()).await.unwrap();
        store.add_message_to_group(&key, gone.clone()).await.unwrap();

        let group = store
            .remove_messages_from_group(&key, &[gone.id(), message(9).id()])
            .await
            .unwrap();
        assert_eq!(group.messages(), &[keep]);
    }

    #[tokio::test]
    async fn last_released_sequence_is_persisted() {
        let store = SimpleMessageGroupStore::new();
        let key: CorrelationKey = "ABC".into();
        store.add_message_to_group(&key, message(1)).await.unwrap();

        store.set_last_released_sequence(&key, 4).await.unwrap();
        let group = store.get_message_group(&key).await.unwrap();
        assert_eq!(group.last_released_sequence(), 4);

        // Unknown key: silently ignored.
        store.set_last_released_sequence(&"missing".into(), 1).await.unwrap();
    }

    struct CountingCallback {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl GroupExpiryCallback for CountingCallback {
        async fn on_expiry(&self, _group: MessageGroup) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn expiry_visits_only_stale_groups() {
        let (store, source) = manual_store(1000);
        store.add_message_to_group(&"old".into(), message(1)).await.unwrap();

        source.advance(10_000);
        store.add_message_to_group(&"fresh".into(), message(2)).await.unwrap();

        let callback = Arc::new(CountingCallback { seen: AtomicUsize::new(0) });
        store.register_expiry_callback(Arc::clone(&callback) as Arc<dyn GroupExpiryCallback>);

        let processed = store
            .expire_message_groups(Duration::from_millis(5000))
            .await
            .unwrap();
        assert_eq!(processed, 1);
        assert_eq!(callback.seen.load(Ordering::SeqCst), 1);
    }

    struct FailingCallback;

    #[async_trait]
    impl GroupExpiryCallback for FailingCallback {
        async fn on_expiry(&self, _group: MessageGroup) -> anyhow::Result<()> {
            anyhow::bail!("callback failure")
        }
    }

    #[tokio::test]
    async fn failing_callback_does_not_abort_the_sweep() {
        let (store, source) = manual_store(1000);
        store.add_message_to_group(&"a".into(), message(1)).await.unwrap();
        store.add_message_to_group(&"b".into(), message(2)).await.unwrap();
        source.advance(10_000);

        store.register_expiry_callback(Arc::new(FailingCallback));
        let counting = Arc::new(CountingCallback { seen: AtomicUsize::new(0) });
        store.register_expiry_callback(Arc::clone(&counting) as Arc<dyn GroupExpiryCallback>);

        let processed = store
            .expire_message_groups(Duration::from_millis(1000))
            .await
            .unwrap();
        assert_eq!(processed, 2);
        assert_eq!(counting.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_to_many_groups_keep_counts_consistent() {
        let store = Arc::new(SimpleMessageGroupStore::new());

        let mut handles = Vec::new();
        for group_index in 0..4_i64 {
            for _ in 0..25 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    let key = CorrelationKey::from(group_index);
                    store
                        .add_message_to_group(&key, Message::builder().payload(json!(0)).build())
                        .await
                        .unwrap();
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.message_group_count(), 4);
        for group_index in 0..4_i64 {
            assert_eq!(store.message_count_for_group(&group_index.into()), 25);
        }
    }
}
