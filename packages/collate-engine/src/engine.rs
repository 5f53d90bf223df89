//! The correlation engine: buffering, release evaluation, and forced
//! completion.
//!
//! Per correlation key a group moves through Empty → Buffering → Releasing →
//! {Released | Expired-Discarded}. One `handle` call performs resolve-key →
//! per-key lock → buffer → evaluate release → process → send → bookkeeping,
//! all under the same physical lock acquisition, so a second release for the
//! same key can never interleave. The reaper enters through
//! [`CorrelationEngine::force_complete`], which takes the same lock and
//! re-fetches the group before acting on it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use collate_core::{
    CorrelationIdStrategy, CorrelationKey, CorrelationStrategy, GroupProcessor, Message,
    MessageGroup, MessageId, MonotonicClock, PayloadAggregatingProcessor, ProcessorOutput,
    ReleaseStrategy, ResequencingProcessor, SequenceSizeReleaseStrategy,
};

use crate::channel::{MessageChannel, NullChannel};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventPublisher, GroupExpiredEvent, NullEventPublisher};
use crate::locks::LockRegistry;
use crate::middleware::{InterceptorStack, ReleaseInterceptor};
use crate::store::{GroupExpiryCallback, MessageGroupStore};

// ---------------------------------------------------------------------------
// AfterReleaseAction
// ---------------------------------------------------------------------------

/// What the engine does to the group's store state after a successful release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterReleaseAction {
    /// Aggregator behavior: mark the group complete so late arrivals are
    /// discarded, or remove it outright when `expire_groups_upon_completion`
    /// is set.
    CompleteGroup,
    /// Resequencer behavior: remove only the released run, advance the
    /// last-released sequence number, and drop the group once the declared
    /// sequence has been fully released.
    RemoveReleasedMessages,
}

/// Which standard strategy/processor defaults the builder resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Aggregator,
    Resequencer,
}

// ---------------------------------------------------------------------------
// CorrelationEngine
// ---------------------------------------------------------------------------

/// Orchestrator for stateful correlation and release.
///
/// Construct through [`CorrelationEngine::builder`] or the
/// [`aggregator`](CorrelationEngine::aggregator) /
/// [`resequencer`](CorrelationEngine::resequencer) presets. The engine
/// registers itself as the store's expiry callback, so a reaper sweeping the
/// store drives [`force_complete`](CorrelationEngine::force_complete) for
/// each stale group.
pub struct CorrelationEngine {
    store: Arc<dyn MessageGroupStore>,
    correlation_strategy: Arc<dyn CorrelationStrategy>,
    release_strategy: Arc<dyn ReleaseStrategy>,
    processor: Arc<dyn GroupProcessor>,
    output_channel: Arc<dyn MessageChannel>,
    discard_channel: Arc<dyn MessageChannel>,
    event_publisher: Arc<dyn EventPublisher>,
    interceptors: InterceptorStack,
    locks: Arc<LockRegistry>,
    after_release: AfterReleaseAction,
    sequence_aware: bool,
    clock: MonotonicClock,
    config: EngineConfig,
}

impl CorrelationEngine {
    /// Starts an aggregator-flavored builder with the default strategies.
    #[must_use]
    pub fn builder(
        store: Arc<dyn MessageGroupStore>,
        output_channel: Arc<dyn MessageChannel>,
    ) -> CorrelationEngineBuilder {
        CorrelationEngineBuilder::new(store, output_channel, HandlerKind::Aggregator)
    }

    /// Aggregator preset: the given processor turns each completed group
    /// into one output message; released groups leave a completed tombstone.
    #[must_use]
    pub fn aggregator<P: GroupProcessor + 'static>(
        store: Arc<dyn MessageGroupStore>,
        processor: P,
        output_channel: Arc<dyn MessageChannel>,
    ) -> CorrelationEngineBuilder {
        CorrelationEngineBuilder::new(store, output_channel, HandlerKind::Aggregator)
            .processor(processor)
    }

    /// Resequencer preset: releases contiguous sequence runs in order,
    /// removing released messages from the group as it goes.
    #[must_use]
    pub fn resequencer(
        store: Arc<dyn MessageGroupStore>,
        output_channel: Arc<dyn MessageChannel>,
    ) -> CorrelationEngineBuilder {
        CorrelationEngineBuilder::new(store, output_channel, HandlerKind::Resequencer)
            .after_release(AfterReleaseAction::RemoveReleasedMessages)
    }

    /// The store this engine buffers groups in.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageGroupStore> {
        &self.store
    }

    /// The engine's configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared per-key lock registry.
    #[must_use]
    pub fn lock_registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    // -----------------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------------

    /// Handles one inbound message: resolves its correlation key, buffers it
    /// under the per-key lock, and releases the group if the release strategy
    /// allows.
    ///
    /// # Errors
    ///
    /// [`EngineError::NullCorrelationKey`] if the strategy resolves no key,
    /// [`EngineError::LockTimeout`] if the per-key lock is not acquired
    /// within the configured bound, [`EngineError::GroupProcessing`] if the
    /// processor fails, and [`EngineError::Store`] for store failures. All
    /// errors are fatal for this message only.
    pub async fn handle(&self, message: Message) -> Result<(), EngineError> {
        let Some(key) = self.correlation_strategy.correlation_key(&message) else {
            return Err(EngineError::NullCorrelationKey {
                message_id: message.id(),
            });
        };
        tracing::trace!(%key, message_id = %message.id(), "handling message");

        let guard = self.acquire_lock(&key).await?;

        let current = self.store.get_message_group(&key).await?;
        if !self.can_buffer(&current, &message) {
            tracing::debug!(%key, message_id = %message.id(), "group rejected message; discarding");
            self.discard(message).await;
            return Ok(());
        }

        let group = self.store.add_message_to_group(&key, message).await?;
        tracing::trace!(%key, size = group.size(), "message buffered");

        if self.release_strategy.can_release(&group) {
            self.release_group(&key, &group, guard).await?;
        }
        Ok(())
    }

    /// Runs one expiry sweep over the store, forcing completion of groups
    /// left over from a prior run. Returns the number of groups visited.
    ///
    /// # Errors
    ///
    /// Propagates store scan failures.
    pub async fn purge_orphaned_groups(&self) -> Result<usize, EngineError> {
        let purged = self
            .store
            .expire_message_groups(self.config.reap_scan_threshold())
            .await?;
        if purged > 0 {
            tracing::info!(purged, "purged orphaned message groups at startup");
        }
        Ok(purged)
    }

    fn can_buffer(&self, group: &MessageGroup, message: &Message) -> bool {
        if group.is_complete() {
            // Completed but not yet removed: discard immediately, never
            // re-buffer.
            return false;
        }
        if group.contains_message(message.id()) {
            return false;
        }
        if self.sequence_aware && !group.can_accept_sequenced(message) {
            return false;
        }
        true
    }

    async fn acquire_lock(
        &self,
        key: &CorrelationKey,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lock = self.locks.obtain(key);
        match self.config.lock_timeout_ms {
            None => Ok(lock.lock_owned().await),
            Some(timeout_ms) => {
                tokio::time::timeout(Duration::from_millis(timeout_ms), lock.lock_owned())
                    .await
                    .map_err(|_elapsed| EngineError::LockTimeout { key: key.clone() })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Release path
    // -----------------------------------------------------------------------

    /// Releases a group from `handle`. The guard is this call's own lock
    /// acquisition; the configured policy decides whether it is dropped
    /// before or after the downstream send.
    async fn release_group(
        &self,
        key: &CorrelationKey,
        group: &MessageGroup,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(), EngineError> {
        self.interceptors.before_release(group);

        let output = match self.processor.process(group) {
            Ok(output) => output,
            Err(source) => {
                let error = EngineError::GroupProcessing {
                    group: Box::new(group.clone()),
                    source,
                };
                self.interceptors.release_failed(group, &error);
                // Bookkeeping still runs so the failing group is not
                // re-released against an ever-growing buffer.
                self.after_release_bookkeeping(key, group, &[], None).await?;
                return Err(error);
            }
        };

        let (released_ids, max_released_sequence) = Self::released_details(group, &output);

        if self.config.release_lock_before_send {
            self.after_release_bookkeeping(key, group, &released_ids, max_released_sequence)
                .await?;
            self.interceptors.after_release(group);
            drop(guard);
            self.send_output(output).await;
        } else {
            self.send_output(output).await;
            self.after_release_bookkeeping(key, group, &released_ids, max_released_sequence)
                .await?;
            self.interceptors.after_release(group);
            drop(guard);
        }
        Ok(())
    }

    /// Which buffered messages an output covers, and the highest sequence
    /// number among them. Aggregated outputs carry fresh identities and map
    /// to nothing; resequenced outputs keep their buffered identities even
    /// when sequencing headers were popped.
    fn released_details(
        group: &MessageGroup,
        output: &ProcessorOutput,
    ) -> (Vec<MessageId>, Option<u32>) {
        let ids: Vec<MessageId> = match output {
            ProcessorOutput::Single(message) => vec![message.id()],
            ProcessorOutput::Multiple(messages) => messages.iter().map(Message::id).collect(),
        };
        let max_sequence = ids
            .iter()
            .filter_map(|id| {
                group
                    .messages()
                    .iter()
                    .find(|m| m.id() == *id)
                    .and_then(Message::sequence_number)
            })
            .max();
        (ids, max_sequence)
    }

    async fn after_release_bookkeeping(
        &self,
        key: &CorrelationKey,
        group: &MessageGroup,
        released_ids: &[MessageId],
        max_released_sequence: Option<u32>,
    ) -> Result<(), EngineError> {
        match self.after_release {
            AfterReleaseAction::CompleteGroup => {
                if self.config.expire_groups_upon_completion {
                    self.store.remove_message_group(key).await?;
                } else {
                    self.store.complete_group(key).await?;
                }
            }
            AfterReleaseAction::RemoveReleasedMessages => {
                if released_ids.is_empty() {
                    return Ok(());
                }
                self.store
                    .remove_messages_from_group(key, released_ids)
                    .await?;
                if let Some(sequence_number) = max_released_sequence {
                    self.store
                        .set_last_released_sequence(key, sequence_number)
                        .await?;
                    if group.sequence_size() == Some(sequence_number) {
                        // Declared sequence fully released.
                        self.store.remove_message_group(key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_output(&self, output: ProcessorOutput) {
        match output {
            ProcessorOutput::Single(message) => self.send_to_output(message).await,
            ProcessorOutput::Multiple(messages) => {
                for message in messages {
                    self.send_to_output(message).await;
                }
            }
        }
    }

    async fn send_to_output(&self, message: Message) {
        if !self
            .output_channel
            .send(message, self.config.send_timeout())
            .await
        {
            tracing::warn!("output channel rejected message; delivery attempt failed");
        }
    }

    async fn discard(&self, message: Message) {
        if !self
            .discard_channel
            .send(message, self.config.send_timeout())
            .await
        {
            tracing::warn!("discard channel rejected message");
        }
    }

    // -----------------------------------------------------------------------
    // Forced completion (reaper path)
    // -----------------------------------------------------------------------

    /// Forces completion of an expiry candidate under the per-key lock.
    ///
    /// `scanned` is the snapshot the sweep saw; the group is re-fetched
    /// after lock acquisition and the snapshot is only trusted for identity:
    /// a completed group is removed without re-running release logic, and a
    /// creation-timestamp mismatch means the key was removed and recreated
    /// since the scan, so the fresh group is left alone.
    ///
    /// Returns `true` when the group was completed, expired, or removed.
    ///
    /// # Errors
    ///
    /// Store and processor failures propagate; the per-key lock is released
    /// on every path, so a failure here can never leave a concurrent
    /// `handle` call blocked forever.
    pub async fn force_complete(&self, scanned: &MessageGroup) -> Result<bool, EngineError> {
        let key = scanned.group_id().clone();
        let lock = self.locks.obtain(&key);
        let _guard = lock.lock_owned().await;

        let fresh = self.store.get_message_group(&key).await?;
        if fresh.timestamp() != scanned.timestamp() {
            tracing::trace!(%key, "group recreated since scan; skipping");
            return Ok(false);
        }
        if fresh.is_complete() {
            // The normal path already released it; drop the tombstone
            // without re-running any release logic.
            self.store.remove_message_group(&key).await?;
            return Ok(true);
        }

        let age = self.clock.now_millis() - fresh.last_modified();
        if fresh.is_empty() {
            if age >= millis_i64(self.config.empty_group_min_timeout_ms) {
                tracing::debug!(%key, "removing emptied-out group");
                self.store.remove_message_group(&key).await?;
                return Ok(true);
            }
            return Ok(false);
        }
        if age < millis_i64(self.config.group_timeout_ms) {
            // Fresh activity since the scan; each addition refreshes
            // last_modified, so a group being actively handled is never
            // reaped out from under the producer.
            tracing::trace!(%key, "group not yet due; skipping");
            return Ok(false);
        }

        if self.release_strategy.can_release(&fresh) {
            let released = self.release_to_output(&fresh).await;
            let removed = self.store.remove_message_group(&key).await;
            released?;
            removed?;
            return Ok(true);
        }
        if !self.config.expire_groups_upon_timeout {
            return Ok(false);
        }
        self.expire_group(&key, &fresh).await.map(|()| true)
    }

    /// Expires a message-bearing group: emits a partial result or discards
    /// every buffered message, publishes the expiry event, and removes the
    /// group. Removal is attempted even when emission failed.
    async fn expire_group(
        &self,
        key: &CorrelationKey,
        group: &MessageGroup,
    ) -> Result<(), EngineError> {
        let send_partial = self.config.send_partial_result_on_expiry;
        tracing::info!(%key, size = group.size(), send_partial, "expiring message group");

        let emitted = if send_partial {
            self.release_to_output(group).await
        } else {
            for message in group.messages() {
                self.discard(message.clone()).await;
            }
            Ok(())
        };

        self.event_publisher.group_expired(GroupExpiredEvent {
            group_id: key.clone(),
            message_count: group.size(),
            discarded: !send_partial,
        });

        let removed = self.store.remove_message_group(key).await;
        emitted?;
        removed?;
        Ok(())
    }

    /// Processes and emits a group without any store bookkeeping; the forced
    /// paths handle removal themselves.
    async fn release_to_output(&self, group: &MessageGroup) -> Result<(), EngineError> {
        self.interceptors.before_release(group);
        match self.processor.process(group) {
            Ok(output) => {
                self.send_output(output).await;
                self.interceptors.after_release(group);
                Ok(())
            }
            Err(source) => {
                let error = EngineError::GroupProcessing {
                    group: Box::new(group.clone()),
                    source,
                };
                self.interceptors.release_failed(group, &error);
                Err(error)
            }
        }
    }
}

fn millis_i64(millis: u64) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Expiry callback registration
// ---------------------------------------------------------------------------

/// Store-side hook into the engine's forced-completion path.
///
/// Holds a weak reference: the store must not keep the engine alive.
struct EngineExpiryCallback {
    engine: Weak<CorrelationEngine>,
}

#[async_trait]
impl GroupExpiryCallback for EngineExpiryCallback {
    async fn on_expiry(&self, group: MessageGroup) -> anyhow::Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        engine.force_complete(&group).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`CorrelationEngine`].
pub struct CorrelationEngineBuilder {
    store: Arc<dyn MessageGroupStore>,
    output_channel: Arc<dyn MessageChannel>,
    discard_channel: Arc<dyn MessageChannel>,
    correlation_strategy: Arc<dyn CorrelationStrategy>,
    release_strategy: Option<Arc<dyn ReleaseStrategy>>,
    processor: Option<Arc<dyn GroupProcessor>>,
    event_publisher: Arc<dyn EventPublisher>,
    interceptors: InterceptorStack,
    locks: Option<Arc<LockRegistry>>,
    after_release: AfterReleaseAction,
    sequence_aware: bool,
    kind: HandlerKind,
    clock: Option<MonotonicClock>,
    config: EngineConfig,
}

impl CorrelationEngineBuilder {
    fn new(
        store: Arc<dyn MessageGroupStore>,
        output_channel: Arc<dyn MessageChannel>,
        kind: HandlerKind,
    ) -> Self {
        Self {
            store,
            output_channel,
            discard_channel: Arc::new(NullChannel),
            correlation_strategy: Arc::new(CorrelationIdStrategy),
            release_strategy: None,
            processor: None,
            event_publisher: Arc::new(NullEventPublisher),
            interceptors: InterceptorStack::default(),
            locks: None,
            after_release: AfterReleaseAction::CompleteGroup,
            sequence_aware: true,
            kind,
            clock: None,
            config: EngineConfig::default(),
        }
    }

    /// Replaces the correlation strategy (default: the `correlation_id`
    /// header).
    #[must_use]
    pub fn correlation_strategy<S: CorrelationStrategy + 'static>(mut self, strategy: S) -> Self {
        self.correlation_strategy = Arc::new(strategy);
        self
    }

    /// Replaces the release strategy. Sequence-aware admission stays on; use
    /// [`sequence_aware`](Self::sequence_aware) to disable it for strategies
    /// that do not read sequencing headers.
    #[must_use]
    pub fn release_strategy<S: ReleaseStrategy + 'static>(mut self, strategy: S) -> Self {
        self.release_strategy = Some(Arc::new(strategy));
        self
    }

    /// Enables partial-sequence release (a contiguous prefix is released
    /// without waiting for the whole sequence).
    #[must_use]
    pub fn release_partial_sequences(mut self, enabled: bool) -> Self {
        self.release_strategy = Some(Arc::new(SequenceSizeReleaseStrategy::new(enabled)));
        self
    }

    /// Replaces the group processor.
    #[must_use]
    pub fn processor<P: GroupProcessor + 'static>(mut self, processor: P) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Sets the discard channel (default: accept-and-drop).
    #[must_use]
    pub fn discard_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.discard_channel = channel;
        self
    }

    /// Sets the event publisher (default: none).
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = publisher;
        self
    }

    /// Appends a release interceptor (outermost first).
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn ReleaseInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Shares an external lock registry (default: a private one).
    #[must_use]
    pub fn lock_registry(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Overrides the after-release behavior.
    #[must_use]
    pub fn after_release(mut self, action: AfterReleaseAction) -> Self {
        self.after_release = action;
        self
    }

    /// Toggles sequence-aware admission checks.
    #[must_use]
    pub fn sequence_aware(mut self, enabled: bool) -> Self {
        self.sequence_aware = enabled;
        self
    }

    /// Shares a clock with the store so age arithmetic runs on one time base.
    #[must_use]
    pub fn clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine and registers it as the store's expiry callback.
    #[must_use]
    pub fn build(self) -> Arc<CorrelationEngine> {
        let release_strategy = self.release_strategy.unwrap_or_else(|| {
            Arc::new(SequenceSizeReleaseStrategy::default()) as Arc<dyn ReleaseStrategy>
        });
        let processor = self.processor.unwrap_or_else(|| match self.kind {
            HandlerKind::Aggregator => {
                Arc::new(PayloadAggregatingProcessor) as Arc<dyn GroupProcessor>
            }
            HandlerKind::Resequencer => {
                Arc::new(ResequencingProcessor::new(self.config.pop_sequence_details))
                    as Arc<dyn GroupProcessor>
            }
        });

        let engine = Arc::new(CorrelationEngine {
            store: self.store,
            correlation_strategy: self.correlation_strategy,
            release_strategy,
            processor,
            output_channel: self.output_channel,
            discard_channel: self.discard_channel,
            event_publisher: self.event_publisher,
            interceptors: self.interceptors,
            locks: self.locks.unwrap_or_default(),
            after_release: self.after_release,
            sequence_aware: self.sequence_aware,
            clock: self.clock.unwrap_or_default(),
            config: self.config,
        });

        engine.store.register_expiry_callback(Arc::new(EngineExpiryCallback {
            engine: Arc::downgrade(&engine),
        }));
        engine
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
