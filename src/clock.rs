//! Clock abstractions used by the limiter, ban cache, and window counters.
//!
//! All timestamps in this crate are milliseconds since the Unix epoch. The
//! default clock reads the wall clock once at construction and then advances
//! with `Instant`, so readings never go backwards even if the system time is
//! stepped while the process runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the Unix epoch. Must be non-decreasing.
    fn now_millis(&self) -> u64;
}

/// Monotonic clock anchored to the wall clock at construction.
///
/// Notes: the anchor is taken once; drift against NTP corrections accumulates
/// for the lifetime of the process. Timestamps written to durable storage by
/// different instances may therefore disagree by that drift.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
    epoch_millis: u64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        let epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self { start: Instant::now(), epoch_millis }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.epoch_millis.saturating_add(elapsed)
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start the clock at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_millis)) }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Time remaining from `now` until `deadline`, zero if already passed.
pub(crate) fn remaining(now: u64, deadline: u64) -> Duration {
    Duration::from_millis(deadline.saturating_sub(now))
}

/// Convert a duration to whole milliseconds, saturating.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
