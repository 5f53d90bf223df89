//! Monotonic time source for group bookkeeping.
//!
//! Group creation timestamps and last-modified times must never repeat or
//! move backwards, even when the OS clock steps or two groups are created
//! within the same wall-clock millisecond. [`MonotonicClock`] combines the
//! wall clock with an atomic high-water mark: every reading is
//! `max(wall, previous + 1)`. The [`ClockSource`] trait allows deterministic
//! testing by replacing the real clock with a manual one.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> i64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as i64
    }
}

/// Manually advanced clock source for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Creates a manual clock starting at the given millisecond value.
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    /// Advances the clock by the given number of milliseconds.
    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute millisecond value.
    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Monotonically increasing millisecond clock.
///
/// Cloning is cheap; clones share the same high-water mark, so readings are
/// strictly increasing across all clones and threads. This is what makes the
/// reaper's timestamp-mismatch check reliable for groups removed and
/// recreated under the same key within a single millisecond.
#[derive(Clone)]
pub struct MonotonicClock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    last: AtomicI64,
    source: Arc<dyn ClockSource>,
}

impl MonotonicClock {
    /// Creates a clock backed by the real system time.
    #[must_use]
    pub fn system() -> Self {
        Self::with_source(Arc::new(SystemClock))
    }

    /// Creates a clock backed by the given source.
    #[must_use]
    pub fn with_source(source: Arc<dyn ClockSource>) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                last: AtomicI64::new(0),
                source,
            }),
        }
    }

    /// Returns the next strictly increasing millisecond reading.
    pub fn now_millis(&self) -> i64 {
        let wall = self.inner.source.now();
        let mut last = self.inner.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self.inner.last.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("last", &self.inner.last.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
