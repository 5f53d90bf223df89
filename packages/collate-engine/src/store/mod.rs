//! Message group storage.
//!
//! Defines [`MessageGroupStore`], the single owner of the correlation key →
//! group mapping, and [`GroupExpiryCallback`] through which the store drives
//! the engine's forced-completion path during expiry sweeps.
//!
//! The store is the only writer of the mapping. The engine and reaper work
//! on snapshots and detect concurrent changes by re-fetching and comparing
//! `timestamp`/`last_modified` -- never by holding a live group reference.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use collate_core::{CorrelationKey, Message, MessageGroup, MessageId};

use crate::error::StoreError;

pub use memory::SimpleMessageGroupStore;

/// Invoked by the store for each group visited during an expiry sweep.
///
/// The engine registers its forced-completion entry point here; the callback
/// re-fetches the group under the per-key lock before acting, so the snapshot
/// it receives is only a candidate.
#[async_trait]
pub trait GroupExpiryCallback: Send + Sync {
    /// Handles one expiry candidate.
    ///
    /// # Errors
    ///
    /// Errors are logged by the store and retried on the next sweep; they do
    /// not abort the sweep.
    async fn on_expiry(&self, group: MessageGroup) -> anyhow::Result<()>;
}

/// Owner of the correlation key → [`MessageGroup`] mapping.
///
/// Used as `Arc<dyn MessageGroupStore>`. Read operations never fail for an
/// absent group (they return an empty snapshot); mutations of invariants --
/// removing a group that does not exist, adding to a completed group outside
/// the discard path -- fail loudly so callers keep their lock bookkeeping
/// consistent.
#[async_trait]
pub trait MessageGroupStore: Send + Sync {
    /// Appends a message to the key's group, creating the group if absent.
    /// Returns the updated group snapshot.
    async fn add_message_to_group(
        &self,
        key: &CorrelationKey,
        message: Message,
    ) -> Result<MessageGroup, StoreError>;

    /// Returns a fresh snapshot of the key's group; an empty group snapshot
    /// if the key is unknown.
    async fn get_message_group(&self, key: &CorrelationKey)
        -> Result<MessageGroup, StoreError>;

    /// Removes the given messages from the key's group. Unknown keys and
    /// absent messages are ignored. Returns the updated snapshot.
    async fn remove_messages_from_group(
        &self,
        key: &CorrelationKey,
        message_ids: &[MessageId],
    ) -> Result<MessageGroup, StoreError>;

    /// Removes the whole group.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::GroupNotFound`] for an unknown key -- callers
    /// must treat this as recoverable and still release their per-key lock.
    async fn remove_message_group(&self, key: &CorrelationKey) -> Result<(), StoreError>;

    /// Marks the key's group complete.
    async fn complete_group(&self, key: &CorrelationKey) -> Result<(), StoreError>;

    /// Advances the group's last-released sequence number. A no-op for
    /// unknown keys.
    async fn set_last_released_sequence(
        &self,
        key: &CorrelationKey,
        sequence_number: u32,
    ) -> Result<(), StoreError>;

    /// Invokes every registered expiry callback for each group whose
    /// `last_modified` age exceeds `older_than`. Returns the number of
    /// groups processed. Iteration is over a snapshot, so concurrent group
    /// mutation during the sweep is safe.
    async fn expire_message_groups(&self, older_than: Duration) -> Result<usize, StoreError>;

    /// Registers a callback for expiry sweeps.
    fn register_expiry_callback(&self, callback: Arc<dyn GroupExpiryCallback>);

    /// Number of groups currently held.
    fn message_group_count(&self) -> usize;

    /// Number of messages buffered for the key. Zero for unknown keys.
    fn message_count_for_group(&self, key: &CorrelationKey) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies `Arc<dyn MessageGroupStore>` compiles (object safety).
    #[test]
    fn message_group_store_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn MessageGroupStore>) {}
    }

    /// Verifies `Arc<dyn GroupExpiryCallback>` compiles (object safety).
    #[test]
    fn expiry_callback_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn GroupExpiryCallback>) {}
    }
}
