//! Message model: identity, headers, payload, and the fluent builder.
//!
//! A [`Message`] is immutable once built. The header block carries the
//! correlation and sequencing details the engine operates on; arbitrary
//! user headers live in the `custom` map.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::key::CorrelationKey;

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Unique identity of a message, used for duplicate detection within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageHeaders
// ---------------------------------------------------------------------------

/// Header block carried by every message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Correlation identity, read by the default correlation strategy.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<CorrelationKey>,
    /// One-based position of this message within its declared sequence.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence_number: Option<u32>,
    /// Declared total size of the sequence this message belongs to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence_size: Option<u32>,
    /// Arbitrary user headers.
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub custom: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An immutable message: identity, headers, and a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    headers: MessageHeaders,
    payload: Value,
}

impl Message {
    /// Starts building a new message with a fresh identity.
    #[must_use]
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// The message identity.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The full header block.
    #[must_use]
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// The payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The correlation id header, if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&CorrelationKey> {
        self.headers.correlation_id.as_ref()
    }

    /// The sequence number header, if present.
    #[must_use]
    pub fn sequence_number(&self) -> Option<u32> {
        self.headers.sequence_number
    }

    /// The sequence size header, if present.
    #[must_use]
    pub fn sequence_size(&self) -> Option<u32> {
        self.headers.sequence_size
    }

    /// A custom header by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.custom.get(name)
    }

    /// A copy of this message with the sequencing headers removed.
    ///
    /// Used by the resequencer when `pop_sequence_details` is enabled, so
    /// released messages do not carry stale sequencing information into a
    /// downstream correlating consumer.
    #[must_use]
    pub fn without_sequence_details(&self) -> Self {
        let mut copy = self.clone();
        copy.headers.sequence_number = None;
        copy.headers.sequence_size = None;
        copy
    }
}

// ---------------------------------------------------------------------------
// MessageBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    headers: MessageHeaders,
    payload: Value,
}

impl MessageBuilder {
    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the correlation id header.
    #[must_use]
    pub fn correlation_id(mut self, key: impl Into<CorrelationKey>) -> Self {
        self.headers.correlation_id = Some(key.into());
        self
    }

    /// Sets the sequence number and declared sequence size headers.
    #[must_use]
    pub fn sequence(mut self, number: u32, size: u32) -> Self {
        self.headers.sequence_number = Some(number);
        self.headers.sequence_size = Some(size);
        self
    }

    /// Adds a custom header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.custom.insert(name.into(), value.into());
        self
    }

    /// Finalizes the message with a fresh random identity.
    #[must_use]
    pub fn build(self) -> Message {
        Message {
            id: MessageId::random(),
            headers: self.headers,
            payload: self.payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
