use std::time::Duration;

/// Engine-level configuration: thresholds, timeouts, and release policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for output/discard channel sends in milliseconds.
    pub send_timeout_ms: u64,
    /// Maximum wait for the per-key lock in `handle`. `None` blocks.
    pub lock_timeout_ms: Option<u64>,
    /// Drop the per-key lock before the downstream send instead of after.
    pub release_lock_before_send: bool,
    /// On expiry, process and emit the partial group instead of discarding.
    pub send_partial_result_on_expiry: bool,
    /// Remove a released group outright instead of keeping a completed
    /// tombstone that rejects late arrivals.
    pub expire_groups_upon_completion: bool,
    /// Whether message-bearing groups expire by age at all. When false, only
    /// empty-group housekeeping applies.
    pub expire_groups_upon_timeout: bool,
    /// Age in milliseconds after which a message-bearing group is expired.
    pub group_timeout_ms: u64,
    /// Minimum age in milliseconds before an emptied-out group is removed.
    /// A distinct, typically shorter expiry class than `group_timeout_ms`.
    pub empty_group_min_timeout_ms: u64,
    /// Interval between reaper sweeps in milliseconds.
    pub reap_interval_ms: u64,
    /// Strip sequencing headers from messages released by the resequencer.
    pub pop_sequence_details: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 1000,
            lock_timeout_ms: None,
            release_lock_before_send: false,
            send_partial_result_on_expiry: false,
            expire_groups_upon_completion: false,
            expire_groups_upon_timeout: true,
            group_timeout_ms: 60_000,
            empty_group_min_timeout_ms: 60_000,
            reap_interval_ms: 1000,
            pop_sequence_details: true,
        }
    }
}

impl EngineConfig {
    /// The channel send timeout as a [`Duration`].
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Age threshold for the reaper's store scan.
    ///
    /// The scan must visit both expiry classes, so it uses the shorter of the
    /// two timeouts; the forced-completion path re-checks the class-specific
    /// threshold under the per-key lock.
    #[must_use]
    pub fn reap_scan_threshold(&self) -> Duration {
        Duration::from_millis(self.group_timeout_ms.min(self.empty_group_min_timeout_ms))
    }
}
