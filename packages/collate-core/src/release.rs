//! Release strategies: decide when a buffered group may be handed to its
//! processor.
//!
//! Strategies are pure predicates over a group snapshot. The engine is the
//! only mutator; a strategy must never modify the group it inspects.

use crate::group::MessageGroup;
use crate::message::Message;

/// Pure predicate: can this group be released now?
pub trait ReleaseStrategy: Send + Sync {
    /// Evaluates the group snapshot. Must be side-effect-free.
    fn can_release(&self, group: &MessageGroup) -> bool;
}

/// Any matching closure is a release strategy.
impl<F> ReleaseStrategy for F
where
    F: Fn(&MessageGroup) -> bool + Send + Sync,
{
    fn can_release(&self, group: &MessageGroup) -> bool {
        self(group)
    }
}

// ---------------------------------------------------------------------------
// Count-based release
// ---------------------------------------------------------------------------

/// Releases once the group has buffered at least `threshold` messages.
#[derive(Debug, Clone, Copy)]
pub struct MessageCountReleaseStrategy {
    threshold: usize,
}

impl MessageCountReleaseStrategy {
    /// Creates a strategy releasing at the given message count.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl ReleaseStrategy for MessageCountReleaseStrategy {
    fn can_release(&self, group: &MessageGroup) -> bool {
        group.size() >= self.threshold
    }
}

// ---------------------------------------------------------------------------
// Sequence-based release
// ---------------------------------------------------------------------------

/// Releases when the declared sequence is fully present, or -- with partial
/// sequences enabled -- as soon as a contiguous run beginning right after the
/// group's last released number exists.
///
/// Gaps block release even if later numbers are present: only a contiguous
/// run starting at `last_released + 1` is ever releasable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceSizeReleaseStrategy {
    release_partial_sequences: bool,
}

impl SequenceSizeReleaseStrategy {
    /// Creates a strategy; with `release_partial_sequences` a contiguous
    /// prefix is released without waiting for the rest of the sequence.
    #[must_use]
    pub fn new(release_partial_sequences: bool) -> Self {
        Self {
            release_partial_sequences,
        }
    }

    /// Whether partial-sequence release is enabled.
    #[must_use]
    pub fn releases_partial_sequences(&self) -> bool {
        self.release_partial_sequences
    }
}

impl ReleaseStrategy for SequenceSizeReleaseStrategy {
    fn can_release(&self, group: &MessageGroup) -> bool {
        if self.release_partial_sequences {
            return !releasable_sequence_run(group).is_empty();
        }
        match group.sequence_size() {
            Some(size) => group.sequence_numbers().len() == size as usize,
            None => false,
        }
    }
}

/// The contiguous run of buffered messages starting at
/// `last_released_sequence + 1`, in ascending sequence order.
///
/// Empty when the next expected number is missing, regardless of what later
/// numbers are buffered. Messages without a sequence number never take part.
#[must_use]
pub fn releasable_sequence_run(group: &MessageGroup) -> Vec<&Message> {
    let mut sequenced: Vec<(u32, &Message)> = group
        .messages()
        .iter()
        .filter_map(|m| m.sequence_number().map(|n| (n, m)))
        .collect();
    sequenced.sort_by_key(|(n, _)| *n);

    let mut run = Vec::new();
    let mut next = group.last_released_sequence() + 1;
    for (number, message) in sequenced {
        if number < next {
            continue;
        }
        if number == next {
            run.push(message);
            next += 1;
        } else {
            break;
        }
    }
    run
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn sequenced(seq: u32, size: u32) -> Message {
        Message::builder()
            .payload(json!(seq))
            .correlation_id("G")
            .sequence(seq, size)
            .build()
    }

    fn group_of(messages: Vec<Message>) -> MessageGroup {
        let mut group = MessageGroup::new("G".into(), 0);
        for message in messages {
            group.add(message).unwrap();
        }
        group
    }

    #[test]
    fn count_strategy_releases_at_threshold() {
        let strategy = MessageCountReleaseStrategy::new(2);
        let mut group = MessageGroup::new("G".into(), 0);
        assert!(!strategy.can_release(&group));

        group.add(Message::builder().payload(json!(1)).build()).unwrap();
        assert!(!strategy.can_release(&group));

        group.add(Message::builder().payload(json!(2)).build()).unwrap();
        assert!(strategy.can_release(&group));

        group.add(Message::builder().payload(json!(3)).build()).unwrap();
        assert!(strategy.can_release(&group));
    }

    #[test]
    fn sequence_strategy_waits_for_the_whole_sequence() {
        let strategy = SequenceSizeReleaseStrategy::default();
        let group = group_of(vec![sequenced(1, 3), sequenced(3, 3)]);
        assert!(!strategy.can_release(&group));

        let full = group_of(vec![sequenced(2, 3), sequenced(1, 3), sequenced(3, 3)]);
        assert!(strategy.can_release(&full));
    }

    #[test]
    fn partial_strategy_releases_a_contiguous_prefix() {
        let strategy = SequenceSizeReleaseStrategy::new(true);

        // 2 alone: gap at 1 blocks release.
        let gapped = group_of(vec![sequenced(2, 3)]);
        assert!(!strategy.can_release(&gapped));

        // 1 alone is a releasable prefix.
        let prefix = group_of(vec![sequenced(1, 3)]);
        assert!(strategy.can_release(&prefix));
    }

    #[test]
    fn partial_strategy_respects_already_released_numbers() {
        let strategy = SequenceSizeReleaseStrategy::new(true);
        let mut group = group_of(vec![sequenced(3, 4)]);
        group.set_last_released_sequence(1);
        // Next expected is 2; 3 is a gap.
        assert!(!strategy.can_release(&group));

        group.set_last_released_sequence(2);
        assert!(strategy.can_release(&group));
    }

    #[test]
    fn run_is_sorted_and_stops_at_the_first_gap() {
        let group = group_of(vec![
            sequenced(2, 5),
            sequenced(1, 5),
            sequenced(5, 5),
            sequenced(3, 5),
        ]);

        let run: Vec<u32> = releasable_sequence_run(&group)
            .iter()
            .filter_map(|m| m.sequence_number())
            .collect();
        assert_eq!(run, vec![1, 2, 3]);
    }

    #[test]
    fn run_is_empty_without_sequence_headers() {
        let group = group_of(vec![Message::builder().payload(json!(1)).build()]);
        assert!(releasable_sequence_run(&group).is_empty());
        assert!(!SequenceSizeReleaseStrategy::default().can_release(&group));
    }

    #[test]
    fn closures_are_release_strategies() {
        let strategy = |group: &MessageGroup| group.size() > 1;
        let group = group_of(vec![sequenced(1, 2), sequenced(2, 2)]);
        assert!(strategy.can_release(&group));
    }

    proptest! {
        /// For any arrival permutation of a subset of 1..=size, the
        /// releasable run is exactly the contiguous prefix beginning at
        /// last_released + 1.
        #[test]
        fn run_is_always_the_contiguous_prefix(
            mut numbers in proptest::collection::btree_set(1u32..20, 0..12),
            last_released in 0u32..10,
        ) {
            let size = 20;
            let mut group = MessageGroup::new("G".into(), 0);
            let buffered: Vec<u32> = numbers.iter().copied().collect();
            for n in &buffered {
                group.add(sequenced(*n, size)).unwrap();
            }
            group.set_last_released_sequence(last_released);

            let run: Vec<u32> = releasable_sequence_run(&group)
                .iter()
                .filter_map(|m| m.sequence_number())
                .collect();

            // Expected: walk up from last_released + 1 while present.
            let mut expected = Vec::new();
            let mut next = last_released + 1;
            while numbers.remove(&next) {
                expected.push(next);
                next += 1;
            }
            prop_assert_eq!(run, expected);
        }
    }
}
