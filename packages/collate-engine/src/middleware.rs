//! Release interceptors: decorators composed around the release call.
//!
//! Interceptors are invoked directly by the engine -- `before_release` in
//! registration order, `after_release` in reverse order (innermost hook
//! closest to the release, like a layered middleware stack), and
//! `release_failed` in reverse order when the processor fails.

use std::sync::Arc;

use collate_core::MessageGroup;

use crate::error::EngineError;

/// Hooks wrapped around every group release.
///
/// All hooks default to no-ops; implement only what you need. Hooks run on
/// the releasing task while the per-key lock is held -- keep them fast.
pub trait ReleaseInterceptor: Send + Sync {
    /// Runs before the group processor is invoked.
    fn before_release(&self, _group: &MessageGroup) {}

    /// Runs after the release completed (output produced and bookkeeping done).
    fn after_release(&self, _group: &MessageGroup) {}

    /// Runs instead of `after_release` when the processor failed.
    fn release_failed(&self, _group: &MessageGroup, _error: &EngineError) {}
}

/// Ordered stack of interceptors.
#[derive(Default)]
pub struct InterceptorStack {
    interceptors: Vec<Arc<dyn ReleaseInterceptor>>,
}

impl InterceptorStack {
    /// Creates a stack over the given interceptors.
    #[must_use]
    pub fn new(interceptors: Vec<Arc<dyn ReleaseInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Appends an interceptor (outermost first).
    pub fn push(&mut self, interceptor: Arc<dyn ReleaseInterceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub(crate) fn before_release(&self, group: &MessageGroup) {
        for interceptor in &self.interceptors {
            interceptor.before_release(group);
        }
    }

    pub(crate) fn after_release(&self, group: &MessageGroup) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.after_release(group);
        }
    }

    pub(crate) fn release_failed(&self, group: &MessageGroup, error: &EngineError) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.release_failed(group, error);
        }
    }
}

/// Logs each release transition at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReleaseInterceptor;

impl ReleaseInterceptor for LoggingReleaseInterceptor {
    fn before_release(&self, group: &MessageGroup) {
        tracing::debug!(group_id = %group.group_id(), size = group.size(), "releasing group");
    }

    fn after_release(&self, group: &MessageGroup) {
        tracing::debug!(group_id = %group.group_id(), "group released");
    }

    fn release_failed(&self, group: &MessageGroup, error: &EngineError) {
        tracing::warn!(group_id = %group.group_id(), %error, "group release failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct OrderRecording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ReleaseInterceptor for OrderRecording {
        fn before_release(&self, _group: &MessageGroup) {
            self.log.lock().push(format!("before:{}", self.name));
        }
        fn after_release(&self, _group: &MessageGroup) {
            self.log.lock().push(format!("after:{}", self.name));
        }
        fn release_failed(&self, _group: &MessageGroup, _error: &EngineError) {
            self.log.lock().push(format!("failed:{}", self.name));
        }
    }

    fn stack_with_log() -> (InterceptorStack, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = InterceptorStack::new(vec![
            Arc::new(OrderRecording { name: "outer", log: Arc::clone(&log) }),
            Arc::new(OrderRecording { name: "inner", log: Arc::clone(&log) }),
        ]);
        (stack, log)
    }

    fn group() -> MessageGroup {
        MessageGroup::new("G".into(), 0)
    }

    #[test]
    fn before_runs_in_order_after_runs_in_reverse() {
        let (stack, log) = stack_with_log();
        let group = group();

        stack.before_release(&group);
        stack.after_release(&group);

        let entries = log.lock().clone();
        assert_eq!(
            entries,
            vec!["before:outer", "before:inner", "after:inner", "after:outer"]
        );
    }

    #[test]
    fn failure_hooks_run_in_reverse_order() {
        let (stack, log) = stack_with_log();
        let group = group();
        let error = EngineError::GroupProcessing {
            group: Box::new(MessageGroup::new("G".into(), 0)),
            source: anyhow::anyhow!("boom"),
        };

        stack.before_release(&group);
        stack.release_failed(&group, &error);

        let entries = log.lock().clone();
        assert_eq!(
            entries,
            vec!["before:outer", "before:inner", "failed:inner", "failed:outer"]
        );
    }

    #[test]
    fn empty_stack_is_a_no_op() {
        let stack = InterceptorStack::default();
        assert!(stack.is_empty());
        let group = group();
        stack.before_release(&group);
        stack.after_release(&group);
    }
}
