//! Group processors: transform a completed group into output messages.

use serde_json::Value;

use crate::group::MessageGroup;
use crate::message::Message;
use crate::release::releasable_sequence_run;

/// What a processor produced for a released group.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutput {
    /// One output message for the whole group (aggregation).
    Single(Message),
    /// Several output messages, sent individually in order (resequencing).
    Multiple(Vec<Message>),
}

/// Pure transformation from a released group to its output.
///
/// Errors propagate to the engine as a handling failure for the group; the
/// engine's cleanup still runs so a failing group is not retried forever
/// against an ever-growing buffer.
pub trait GroupProcessor: Send + Sync {
    /// Processes the group snapshot.
    ///
    /// # Errors
    ///
    /// Any failure is wrapped by the engine into its group-processing error.
    fn process(&self, group: &MessageGroup) -> anyhow::Result<ProcessorOutput>;
}

/// Any matching closure is a group processor.
impl<F> GroupProcessor for F
where
    F: Fn(&MessageGroup) -> anyhow::Result<ProcessorOutput> + Send + Sync,
{
    fn process(&self, group: &MessageGroup) -> anyhow::Result<ProcessorOutput> {
        self(group)
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Collects all payloads into a JSON array, in insertion order, and emits a
/// single message correlated to the group.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadAggregatingProcessor;

impl GroupProcessor for PayloadAggregatingProcessor {
    fn process(&self, group: &MessageGroup) -> anyhow::Result<ProcessorOutput> {
        let payloads: Vec<Value> = group
            .messages()
            .iter()
            .map(|m| m.payload().clone())
            .collect();

        let output = Message::builder()
            .payload(Value::Array(payloads))
            .correlation_id(group.group_id().clone())
            .build();
        Ok(ProcessorOutput::Single(output))
    }
}

// ---------------------------------------------------------------------------
// Resequencing
// ---------------------------------------------------------------------------

/// Emits the group's releasable contiguous run, ordered by sequence number.
///
/// With `pop_sequence_details` enabled (the default), released messages have
/// their sequencing headers stripped so a downstream correlating consumer
/// does not see stale positions.
#[derive(Debug, Clone, Copy)]
pub struct ResequencingProcessor {
    pop_sequence_details: bool,
}

impl ResequencingProcessor {
    /// Creates a processor; see the type docs for `pop_sequence_details`.
    #[must_use]
    pub fn new(pop_sequence_details: bool) -> Self {
        Self {
            pop_sequence_details,
        }
    }
}

impl Default for ResequencingProcessor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl GroupProcessor for ResequencingProcessor {
    fn process(&self, group: &MessageGroup) -> anyhow::Result<ProcessorOutput> {
        let run = releasable_sequence_run(group);
        anyhow::ensure!(
            !run.is_empty(),
            "group `{}` has no contiguous run to release",
            group.group_id()
        );

        let messages: Vec<Message> = run
            .into_iter()
            .map(|m| {
                if self.pop_sequence_details {
                    m.without_sequence_details()
                } else {
                    m.clone()
                }
            })
            .collect();
        Ok(ProcessorOutput::Multiple(messages))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
