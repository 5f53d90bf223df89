//! Correlation strategies: resolve a message to its correlation key.

use serde_json::Value;

use crate::key::CorrelationKey;
use crate::message::Message;

/// Pure function from message to correlation key.
///
/// Must be deterministic for a given message and free of side effects.
/// Returning `None` is a fatal per-message error: the engine rejects the
/// message rather than buffer it under an undefined key.
pub trait CorrelationStrategy: Send + Sync {
    /// Resolves the correlation key for a message.
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey>;
}

/// Any matching closure is a correlation strategy.
impl<F> CorrelationStrategy for F
where
    F: Fn(&Message) -> Option<CorrelationKey> + Send + Sync,
{
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey> {
        self(message)
    }
}

/// Default strategy: the message's `correlation_id` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationIdStrategy;

impl CorrelationStrategy for CorrelationIdStrategy {
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey> {
        message.correlation_id().cloned()
    }
}

/// Correlates on a named custom header.
///
/// String and integer header values become keys; anything else resolves to
/// `None` and the message is rejected.
#[derive(Debug, Clone)]
pub struct HeaderCorrelationStrategy {
    header: String,
}

impl HeaderCorrelationStrategy {
    /// Creates a strategy reading the given custom header.
    #[must_use]
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl CorrelationStrategy for HeaderCorrelationStrategy {
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey> {
        match message.header(&self.header)? {
            Value::String(s) => Some(CorrelationKey::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(CorrelationKey::Int),
            other => {
                tracing::debug!(
                    header = %self.header,
                    ?other,
                    "header value is not usable as a correlation key"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn correlation_id_strategy_reads_the_header() {
        let message = Message::builder().payload(json!(1)).correlation_id("ABC").build();
        assert_eq!(
            CorrelationIdStrategy.correlation_key(&message),
            Some(CorrelationKey::from("ABC"))
        );
    }

    #[test]
    fn correlation_id_strategy_returns_none_when_absent() {
        let message = Message::builder().payload(json!(1)).build();
        assert_eq!(CorrelationIdStrategy.correlation_key(&message), None);
    }

    #[test]
    fn header_strategy_coerces_strings_and_integers() {
        let strategy = HeaderCorrelationStrategy::new("order");

        let text = Message::builder().payload(json!(1)).header("order", "o-1").build();
        assert_eq!(strategy.correlation_key(&text), Some(CorrelationKey::from("o-1")));

        let int = Message::builder().payload(json!(1)).header("order", 77).build();
        assert_eq!(strategy.correlation_key(&int), Some(CorrelationKey::from(77_i64)));

        let unusable = Message::builder().payload(json!(1)).header("order", json!([1])).build();
        assert_eq!(strategy.correlation_key(&unusable), None);

        let absent = Message::builder().payload(json!(1)).build();
        assert_eq!(strategy.correlation_key(&absent), None);
    }

    #[test]
    fn closures_are_strategies() {
        let strategy = |message: &Message| -> Option<CorrelationKey> {
            message.payload().as_str().map(CorrelationKey::from)
        };

        let message = Message::builder().payload(json!("from-payload")).build();
        assert_eq!(
            strategy.correlation_key(&message),
            Some(CorrelationKey::from("from-payload"))
        );
    }
}
