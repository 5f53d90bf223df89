//! Engine event publishing.
//!
//! The reaper reports every expiry through [`EventPublisher`]. Publishing is
//! synchronous and must be cheap; anything slow belongs behind a channel in
//! the subscriber.

use std::sync::Arc;

use serde::Serialize;

use collate_core::CorrelationKey;

/// Published when the reaper expires a message group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupExpiredEvent {
    /// The expired group's correlation key.
    pub group_id: CorrelationKey,
    /// Number of messages buffered at expiry time.
    pub message_count: usize,
    /// `true` when the buffered messages went to the discard channel,
    /// `false` when a partial result was emitted instead.
    pub discarded: bool,
}

/// Receiver for engine events.
pub trait EventPublisher: Send + Sync {
    /// Called once per reaper expiry action.
    fn group_expired(&self, event: GroupExpiredEvent);
}

/// Swallows every event. The default publisher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventPublisher;

impl EventPublisher for NullEventPublisher {
    fn group_expired(&self, _event: GroupExpiredEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventPublisher;

impl EventPublisher for TracingEventPublisher {
    fn group_expired(&self, event: GroupExpiredEvent) {
        tracing::info!(
            group_id = %event.group_id,
            message_count = event.message_count,
            discarded = event.discarded,
            "message group expired"
        );
    }
}

/// Fans events out to multiple publishers, in registration order.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    /// Creates a composite over the given publishers.
    #[must_use]
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }

    /// Adds a publisher after construction.
    pub fn add(&mut self, publisher: Arc<dyn EventPublisher>) {
        self.publishers.push(publisher);
    }
}

impl EventPublisher for CompositeEventPublisher {
    fn group_expired(&self, event: GroupExpiredEvent) {
        for publisher in &self.publishers {
            publisher.group_expired(event.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
