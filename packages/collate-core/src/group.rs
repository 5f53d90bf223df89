//! Message group: the buffer of correlated messages for one key.
//!
//! A [`MessageGroup`] is append-only until released. The store is the only
//! component that mutates groups; the engine and reaper always work on
//! snapshots fetched from the store (stale snapshots are detected by
//! comparing `timestamp`/`last_modified`).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::key::CorrelationKey;
use crate::message::{Message, MessageId};

/// Error raised when a message identity is already present in a group.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate message {message_id} in group `{group_id}`")]
pub struct DuplicateMessageError {
    /// The group that rejected the addition.
    pub group_id: CorrelationKey,
    /// The duplicated message identity.
    pub message_id: MessageId,
}

/// Buffer of correlated messages plus release bookkeeping.
///
/// Invariants:
/// - `complete` is set exactly once and never reset; a complete group must
///   never accept further additions (the engine routes such messages to the
///   discard path instead).
/// - `last_modified` is monotonically non-decreasing.
/// - message identities are unique within the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageGroup {
    group_id: CorrelationKey,
    messages: Vec<Message>,
    timestamp: i64,
    last_modified: i64,
    complete: bool,
    last_released_sequence: u32,
}

impl MessageGroup {
    /// Creates an empty group with the given creation timestamp.
    #[must_use]
    pub fn new(group_id: CorrelationKey, timestamp: i64) -> Self {
        Self {
            group_id,
            messages: Vec::new(),
            timestamp,
            last_modified: timestamp,
            complete: false,
            last_released_sequence: 0,
        }
    }

    /// The correlation key this group buffers messages for.
    #[must_use]
    pub fn group_id(&self) -> &CorrelationKey {
        &self.group_id
    }

    /// Appends a message.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateMessageError`] if a message with the same identity
    /// is already buffered.
    pub fn add(&mut self, message: Message) -> Result<(), DuplicateMessageError> {
        if self.contains_message(message.id()) {
            return Err(DuplicateMessageError {
                group_id: self.group_id.clone(),
                message_id: message.id(),
            });
        }
        self.messages.push(message);
        Ok(())
    }

    /// Removes a message by identity, returning it if it was buffered.
    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let position = self.messages.iter().position(|m| m.id() == id)?;
        Some(self.messages.remove(position))
    }

    /// Read-only view of the buffered messages, in insertion order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The first buffered message, if any.
    #[must_use]
    pub fn one(&self) -> Option<&Message> {
        self.messages.first()
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn size(&self) -> usize {
        self.messages.len()
    }

    /// Whether the group holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the given message identity is already buffered.
    #[must_use]
    pub fn contains_message(&self, id: MessageId) -> bool {
        self.messages.iter().any(|m| m.id() == id)
    }

    /// Marks the group complete. Idempotent.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Whether the group has been marked complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Creation timestamp (milliseconds). Immutable for the group's lifetime.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Last mutation timestamp (milliseconds).
    #[must_use]
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Advances `last_modified`. Readings from the past are ignored so the
    /// value never decreases.
    pub fn set_last_modified(&mut self, now: i64) {
        self.last_modified = self.last_modified.max(now);
    }

    /// Declared sequence size, taken from the first buffered message.
    #[must_use]
    pub fn sequence_size(&self) -> Option<u32> {
        self.messages.first().and_then(Message::sequence_size)
    }

    /// Distinct sequence numbers observed so far, in ascending order.
    #[must_use]
    pub fn sequence_numbers(&self) -> BTreeSet<u32> {
        self.messages
            .iter()
            .filter_map(Message::sequence_number)
            .collect()
    }

    /// Highest sequence number already released from this group.
    #[must_use]
    pub fn last_released_sequence(&self) -> u32 {
        self.last_released_sequence
    }

    /// Advances the last-released sequence number. Never decreases.
    pub fn set_last_released_sequence(&mut self, sequence_number: u32) {
        self.last_released_sequence = self.last_released_sequence.max(sequence_number);
    }

    /// Sequence-aware admission check.
    ///
    /// Rejects messages whose declared sequence size disagrees with the
    /// group's, or whose sequence number was already observed. Messages
    /// without sequencing headers are always admissible. This prevents
    /// sequences growing larger than their declared size or ending up with
    /// duplicated positions.
    #[must_use]
    pub fn can_accept_sequenced(&self, message: &Message) -> bool {
        if self.messages.is_empty() {
            return true;
        }
        let Some(number) = message.sequence_number() else {
            return true;
        };
        if number == 0 {
            return true;
        }
        if message.sequence_size() != self.sequence_size() {
            return false;
        }
        !self.sequence_numbers().contains(&number)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(seq: u32, size: u32) -> Message {
        Message::builder()
            .payload(json!(seq))
            .correlation_id("G")
            .sequence(seq, size)
            .build()
    }

    #[test]
    fn new_group_is_empty_and_incomplete() {
        let group = MessageGroup::new("G".into(), 1000);
        assert!(group.is_empty());
        assert_eq!(group.size(), 0);
        assert!(!group.is_complete());
        assert_eq!(group.timestamp(), 1000);
        assert_eq!(group.last_modified(), 1000);
        assert_eq!(group.last_released_sequence(), 0);
    }

    #[test]
    fn add_buffers_in_insertion_order() {
        let mut group = MessageGroup::new("G".into(), 0);
        let first = message(2, 2);
        let second = message(1, 2);
        group.add(first.clone()).unwrap();
        group.add(second.clone()).unwrap();

        assert_eq!(group.size(), 2);
        assert_eq!(group.messages()[0], first);
        assert_eq!(group.messages()[1], second);
        assert_eq!(group.one(), Some(&first));
    }

    #[test]
    fn add_rejects_duplicate_identity() {
        let mut group = MessageGroup::new("G".into(), 0);
        let msg = message(1, 2);
        group.add(msg.clone()).unwrap();

        let err = group.add(msg.clone()).unwrap_err();
        assert_eq!(err.message_id, msg.id());
        assert_eq!(err.group_id, CorrelationKey::from("G"));
        assert_eq!(group.size(), 1);
    }

    #[test]
    fn remove_returns_the_buffered_message() {
        let mut group = MessageGroup::new("G".into(), 0);
        let msg = message(1, 1);
        group.add(msg.clone()).unwrap();

        assert_eq!(group.remove(msg.id()), Some(msg.clone()));
        assert!(group.is_empty());
        assert_eq!(group.remove(msg.id()), None);
    }

    #[test]
    fn mark_complete_is_idempotent() {
        let mut group = MessageGroup::new("G".into(), 0);
        group.mark_complete();
        assert!(group.is_complete());
        group.mark_complete();
        assert!(group.is_complete());
    }

    #[test]
    fn last_modified_never_decreases() {
        let mut group = MessageGroup::new("G".into(), 1000);
        group.set_last_modified(2000);
        assert_eq!(group.last_modified(), 2000);
        group.set_last_modified(500);
        assert_eq!(group.last_modified(), 2000);
    }

    #[test]
    fn last_released_sequence_never_decreases() {
        let mut group = MessageGroup::new("G".into(), 0);
        group.set_last_released_sequence(3);
        group.set_last_released_sequence(1);
        assert_eq!(group.last_released_sequence(), 3);
    }

    #[test]
    fn sequence_bookkeeping_reads_headers() {
        let mut group = MessageGroup::new("G".into(), 0);
        group.add(message(3, 5)).unwrap();
        group.add(message(1, 5)).unwrap();

        assert_eq!(group.sequence_size(), Some(5));
        let numbers: Vec<u32> = group.sequence_numbers().into_iter().collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn sequenced_admission_rejects_size_mismatch_and_duplicates() {
        let mut group = MessageGroup::new("G".into(), 0);
        group.add(message(1, 3)).unwrap();

        // Same declared size, unseen number: admissible.
        assert!(group.can_accept_sequenced(&message(2, 3)));
        // Declared size disagrees with the group.
        assert!(!group.can_accept_sequenced(&message(2, 4)));
        // Sequence number already observed.
        assert!(!group.can_accept_sequenced(&message(1, 3)));
        // No sequencing headers: always admissible.
        assert!(group.can_accept_sequenced(&Message::builder().payload(json!(0)).build()));
    }

    #[test]
    fn sequenced_admission_accepts_anything_into_an_empty_group() {
        let group = MessageGroup::new("G".into(), 0);
        assert!(group.can_accept_sequenced(&message(7, 9)));
    }
}
