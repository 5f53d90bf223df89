//! Error taxonomy for the correlation engine.
//!
//! Strategy and correlation errors are fatal for the offending message only;
//! they never affect other groups. Store errors propagate -- but the engine
//! guarantees the per-key lock is released on every error path, so a failed
//! store operation can never leave a concurrent `handle` call deadlocked.

use collate_core::{CorrelationKey, DuplicateMessageError, MessageGroup, MessageId};

/// Errors raised by [`MessageGroupStore`](crate::store::MessageGroupStore)
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Removal was requested for a group the store does not hold.
    #[error("message group `{key}` not found")]
    GroupNotFound {
        /// The missing group's key.
        key: CorrelationKey,
    },

    /// A mutation was attempted on a completed group outside the discard path.
    #[error("cannot mutate completed group `{key}`")]
    CompletedGroupMutation {
        /// The completed group's key.
        key: CorrelationKey,
    },

    /// The group is at its configured capacity.
    #[error("group `{key}` is at capacity ({capacity} messages)")]
    CapacityExceeded {
        /// The full group's key.
        key: CorrelationKey,
        /// The configured per-group capacity.
        capacity: usize,
    },

    /// A message identity was already buffered in the group.
    #[error(transparent)]
    Duplicate(#[from] DuplicateMessageError),

    /// Failure in a pluggable backend.
    #[error("store backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Errors surfaced to callers of the engine's handling entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The correlation strategy resolved no key; the message is rejected, not
    /// buffered.
    #[error("correlation strategy produced no key for message {message_id}")]
    NullCorrelationKey {
        /// The rejected message.
        message_id: MessageId,
    },

    /// Barrier variant only: the key is already occupied by another in-flight
    /// caller.
    #[error("correlation key `{key}` is already in use by another in-flight caller")]
    DuplicateCorrelationInUse {
        /// The contested key.
        key: CorrelationKey,
    },

    /// The group processor failed; carries the group it was processing.
    #[error("group processor failed for group `{}`", group.group_id())]
    GroupProcessing {
        /// The group whose release failed, as the processor saw it.
        group: Box<MessageGroup>,
        /// The processor's failure.
        #[source]
        source: anyhow::Error,
    },

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The per-key lock could not be acquired within the configured timeout.
    #[error("timed out acquiring the lock for correlation key `{key}`")]
    LockTimeout {
        /// The contested key.
        key: CorrelationKey,
    },
}
