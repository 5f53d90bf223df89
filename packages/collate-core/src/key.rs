//! Correlation key type.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity grouping related messages together.
///
/// A key is assigned exactly once -- by a
/// [`CorrelationStrategy`](crate::CorrelationStrategy) when the first message
/// of a group arrives -- and never changes for the lifetime of that group.
/// Keys are hashable and comparable so they can index the group store and
/// the per-key lock registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationKey {
    /// Textual key, e.g. an order number or a header value.
    Text(String),
    /// Integral key.
    Int(i64),
    /// UUID key, e.g. a request id.
    Id(Uuid),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

impl From<&str> for CorrelationKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CorrelationKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for CorrelationKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Uuid> for CorrelationKey {
    fn from(value: Uuid) -> Self {
        Self::Id(value)
    }
}
