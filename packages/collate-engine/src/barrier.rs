//! Barrier handler: suspend a caller until a correlated release arrives.
//!
//! A caller presents a trigger message and blocks on a rendezvous until a
//! release message with the same correlation key shows up, or the timeout
//! elapses. Releases that arrive before their trigger are parked. Exactly
//! one caller may occupy a key at a time; a second trigger (or a second
//! early release) fails with `DuplicateCorrelationInUse`.
//!
//! The wait is cancellation-safe: a timed-out caller removes its rendezvous
//! entry before returning, and a release racing the timeout is salvaged
//! rather than lost.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use collate_core::{
    CorrelationIdStrategy, CorrelationKey, CorrelationStrategy, GroupProcessor, Message,
    MessageGroup, MonotonicClock, PayloadAggregatingProcessor, ProcessorOutput,
};

use crate::channel::{MessageChannel, NullChannel};
use crate::error::EngineError;

/// State of one rendezvous key.
enum BarrierSlot {
    /// A trigger is suspended, waiting for its release.
    WaitingTrigger(oneshot::Sender<Message>),
    /// A release arrived before its trigger and is parked.
    EarlyRelease(Message),
}

/// How a trigger proceeds after claiming its slot.
enum TriggerPath {
    Immediate(Message),
    Wait(oneshot::Receiver<Message>),
}

/// Rendezvous barrier over correlation keys.
pub struct BarrierHandler {
    suspensions: DashMap<CorrelationKey, BarrierSlot>,
    correlation_strategy: Arc<dyn CorrelationStrategy>,
    processor: Arc<dyn GroupProcessor>,
    output_channel: Arc<dyn MessageChannel>,
    discard_channel: Arc<dyn MessageChannel>,
    clock: MonotonicClock,
    trigger_timeout: Duration,
    send_timeout: Duration,
}

impl BarrierHandler {
    /// Creates a barrier sending completed pairs to the given channel, with
    /// the default correlation strategy, aggregating processor, and a
    /// 30 second trigger timeout.
    #[must_use]
    pub fn new(output_channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            suspensions: DashMap::new(),
            correlation_strategy: Arc::new(CorrelationIdStrategy),
            processor: Arc::new(PayloadAggregatingProcessor),
            output_channel,
            discard_channel: Arc::new(NullChannel),
            clock: MonotonicClock::system(),
            trigger_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_millis(1000),
        }
    }

    /// Replaces the correlation strategy.
    #[must_use]
    pub fn with_correlation_strategy<S: CorrelationStrategy + 'static>(
        mut self,
        strategy: S,
    ) -> Self {
        self.correlation_strategy = Arc::new(strategy);
        self
    }

    /// Replaces the processor applied to each trigger/release pair.
    #[must_use]
    pub fn with_processor<P: GroupProcessor + 'static>(mut self, processor: P) -> Self {
        self.processor = Arc::new(processor);
        self
    }

    /// Sets the discard channel for timed-out triggers.
    #[must_use]
    pub fn with_discard_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.discard_channel = channel;
        self
    }

    /// Sets how long a trigger waits for its release.
    #[must_use]
    pub fn with_trigger_timeout(mut self, timeout: Duration) -> Self {
        self.trigger_timeout = timeout;
        self
    }

    /// Number of keys currently occupied (suspended triggers plus parked
    /// releases).
    #[must_use]
    pub fn suspended_count(&self) -> usize {
        self.suspensions.len()
    }

    /// Presents a trigger and waits for the correlated release.
    ///
    /// Returns the processed output message, or `None` when the wait timed
    /// out (the trigger is then routed to the discard channel and the
    /// rendezvous entry cleaned up).
    ///
    /// # Errors
    ///
    /// [`EngineError::NullCorrelationKey`] when no key resolves and
    /// [`EngineError::DuplicateCorrelationInUse`] when another trigger
    /// already occupies the key.
    pub async fn trigger(&self, message: Message) -> Result<Option<Message>, EngineError> {
        let Some(key) = self.correlation_strategy.correlation_key(&message) else {
            return Err(EngineError::NullCorrelationKey {
                message_id: message.id(),
            });
        };
        tracing::trace!(%key, "barrier trigger");

        let path = match self.suspensions.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                if matches!(occupied.get(), BarrierSlot::WaitingTrigger(_)) {
                    return Err(EngineError::DuplicateCorrelationInUse { key });
                }
                let BarrierSlot::EarlyRelease(release) = occupied.remove() else {
                    // Only two variants; WaitingTrigger returned above.
                    return Err(EngineError::DuplicateCorrelationInUse { key });
                };
                TriggerPath::Immediate(release)
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(BarrierSlot::WaitingTrigger(tx));
                TriggerPath::Wait(rx)
            }
        };

        let mut rx = match path {
            TriggerPath::Immediate(release) => {
                return self.complete(&key, message, release).await.map(Some);
            }
            TriggerPath::Wait(rx) => rx,
        };

        match tokio::time::timeout(self.trigger_timeout, &mut rx).await {
            Ok(Ok(release)) => self.complete(&key, message, release).await.map(Some),
            Ok(Err(_closed)) => {
                // Sender dropped without a release; clean up and discard.
                self.suspensions
                    .remove_if(&key, |_, slot| matches!(slot, BarrierSlot::WaitingTrigger(_)));
                self.discard(message).await;
                Ok(None)
            }
            Err(_elapsed) => {
                // A release may have raced the timeout: it takes the sender
                // out of the map before sending, so check the channel before
                // and after removing our entry.
                if let Ok(release) = rx.try_recv() {
                    return self.complete(&key, message, release).await.map(Some);
                }
                self.suspensions
                    .remove_if(&key, |_, slot| matches!(slot, BarrierSlot::WaitingTrigger(_)));
                if let Ok(release) = rx.try_recv() {
                    return self.complete(&key, message, release).await.map(Some);
                }
                tracing::debug!(%key, "barrier trigger timed out; discarding");
                self.discard(message).await;
                Ok(None)
            }
        }
    }

    /// Presents a release message, waking the suspended trigger for its key
    /// or parking the release if the trigger has not arrived yet.
    ///
    /// # Errors
    ///
    /// [`EngineError::NullCorrelationKey`] when no key resolves and
    /// [`EngineError::DuplicateCorrelationInUse`] when a release is already
    /// parked for the key.
    pub fn release(&self, message: Message) -> Result<(), EngineError> {
        let Some(key) = self.correlation_strategy.correlation_key(&message) else {
            return Err(EngineError::NullCorrelationKey {
                message_id: message.id(),
            });
        };
        tracing::trace!(%key, "barrier release");

        match self.suspensions.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                if matches!(occupied.get(), BarrierSlot::EarlyRelease(_)) {
                    return Err(EngineError::DuplicateCorrelationInUse { key });
                }
                let BarrierSlot::WaitingTrigger(tx) = occupied.remove() else {
                    return Err(EngineError::DuplicateCorrelationInUse { key });
                };
                if let Err(returned) = tx.send(message) {
                    // The trigger gave up in the meantime; park the release
                    // for the next one.
                    self.suspensions
                        .insert(key, BarrierSlot::EarlyRelease(returned));
                }
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(BarrierSlot::EarlyRelease(message));
                Ok(())
            }
        }
    }

    /// Processes the trigger/release pair and sends the result downstream.
    async fn complete(
        &self,
        key: &CorrelationKey,
        trigger: Message,
        release: Message,
    ) -> Result<Message, EngineError> {
        let mut group = MessageGroup::new(key.clone(), self.clock.now_millis());
        for message in [trigger, release] {
            if let Err(duplicate) = group.add(message) {
                return Err(EngineError::GroupProcessing {
                    group: Box::new(group),
                    source: anyhow::Error::from(duplicate),
                });
            }
        }

        let output = match self.processor.process(&group) {
            Ok(output) => output,
            Err(source) => {
                return Err(EngineError::GroupProcessing {
                    group: Box::new(group),
                    source,
                });
            }
        };

        let result = match output {
            ProcessorOutput::Single(message) => message,
            ProcessorOutput::Multiple(mut messages) => {
                if messages.is_empty() {
                    return Err(EngineError::GroupProcessing {
                        group: Box::new(group),
                        source: anyhow::anyhow!("barrier processor produced no output"),
                    });
                }
                messages.swap_remove(0)
            }
        };

        if !self
            .output_channel
            .send(result.clone(), self.send_timeout)
            .await
        {
            tracing::warn!(%key, "output channel rejected barrier result");
        }
        Ok(result)
    }

    async fn discard(&self, message: Message) {
        if !self.discard_channel.send(message, self.send_timeout).await {
            tracing::warn!("discard channel rejected barrier trigger");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
