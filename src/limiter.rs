//! Per-client in-memory token buckets.
//!
//! This is the synchronous fast path consulted on every request. Each client
//! gets a bucket holding up to `burst` tokens, refilled lazily at `rate`
//! tokens per second whenever the client is seen again; an admitted request
//! spends one token.
//!
//! Invariants:
//! - `0 <= tokens <= burst` for every bucket.
//! - Elapsed time is computed with a saturating subtraction over a
//!   non-decreasing clock, so refill is never negative.
//! - The map lock is held only for O(1) arithmetic; no I/O happens under it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{millis, Clock, MonotonicClock};

/// Slack absorbing float rounding in `elapsed * rate` so a client that waited
/// exactly `1/rate` seconds gets its token.
const TOKEN_EPSILON: f64 = 1e-9;

/// The decision returned by the limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Whole tokens left after this request.
        remaining: u32,
    },
    /// The bucket is empty.
    Denied {
        /// How long until one token is available.
        wait: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Limits {
    rate: f64,
    burst: f64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: u64,
}

impl Bucket {
    fn refilled(&self, now: u64, limits: Limits) -> f64 {
        let elapsed_ms = now.saturating_sub(self.last_refill) as f64;
        (self.tokens + elapsed_ms * limits.rate / 1000.0).min(limits.burst)
    }
}

#[derive(Debug)]
struct State {
    limits: Limits,
    buckets: HashMap<String, Bucket>,
}

/// Token bucket limiter keyed by client identifier.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter refilling `rate` tokens/sec up to `burst`.
    ///
    /// `rate` must be finite and positive and `burst` at least 1; the gate
    /// validates both through [`GateConfig`](crate::GateConfig).
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_clock(rate, burst, Arc::new(MonotonicClock::default()))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(rate: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State {
                limits: Limits { rate, burst: f64::from(burst) },
                buckets: HashMap::new(),
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The critical sections cannot leave the map half-updated, so a
        // poisoned lock still guards consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spend one token for `client_id` if available.
    pub fn allow(&self, client_id: &str) -> bool {
        self.acquire(client_id).is_allowed()
    }

    /// Spend one token for `client_id`, reporting remaining tokens or the wait.
    pub fn acquire(&self, client_id: &str) -> Decision {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let limits = state.limits;

        let bucket = state
            .buckets
            .entry(client_id.to_string())
            .or_insert(Bucket { tokens: limits.burst, last_refill: now });

        let tokens = bucket.refilled(now, limits);
        bucket.last_refill = bucket.last_refill.max(now);

        if tokens + TOKEN_EPSILON >= 1.0 {
            bucket.tokens = (tokens - 1.0).max(0.0);
            Decision::Allowed { remaining: bucket.tokens as u32 }
        } else {
            bucket.tokens = tokens;
            let wait_secs = (1.0 - tokens) / limits.rate;
            Decision::Denied { wait: Duration::from_millis((wait_secs * 1000.0).ceil() as u64) }
        }
    }

    /// Change rate and burst. Existing buckets are clamped to the new burst on
    /// their next refill.
    pub fn update_limits(&self, rate: f64, burst: u32) {
        let mut state = self.lock();
        state.limits = Limits { rate, burst: f64::from(burst) };
    }

    /// Drop buckets that are full again and have not been touched for `idle_for`.
    ///
    /// Returns how many were evicted. A forgotten client starts over with a
    /// full bucket, which is exactly what it would have had anyway.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = self.clock.now_millis();
        let idle_ms = millis(idle_for);
        let mut state = self.lock();
        let limits = state.limits;
        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| {
            let full = bucket.refilled(now, limits) >= limits.burst;
            let idle = now.saturating_sub(bucket.last_refill) >= idle_ms;
            !(full && idle)
        });
        before - state.buckets.len()
    }

    /// Number of clients currently holding a bucket.
    pub fn tracked_clients(&self) -> usize {
        self.lock().buckets.len()
    }

    /// Tokens available to `client_id` right now, if it has a bucket.
    pub fn available(&self, client_id: &str) -> Option<f64> {
        let now = self.clock.now_millis();
        let state = self.lock();
        state.buckets.get(client_id).map(|b| b.refilled(now, state.limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(rate: f64, burst: u32) -> (TokenBucketLimiter, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (TokenBucketLimiter::with_clock(rate, burst, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn burst_then_deny_then_refill_one() {
        let (limiter, clock) = limiter(10.0, 5);
        for _ in 0..5 {
            assert!(limiter.allow("a"));
        }
        assert!(!limiter.allow("a"), "burst + 1 must be denied");

        clock.advance(Duration::from_millis(100)); // 1 / rate
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn denied_reports_wait_until_next_token() {
        let (limiter, clock) = limiter(2.0, 1);
        assert!(limiter.allow("a"));
        match limiter.acquire("a") {
            Decision::Denied { wait } => assert_eq!(wait, Duration::from_millis(500)),
            other => panic!("expected denial, got {other:?}"),
        }
        clock.advance(Duration::from_millis(250));
        match limiter.acquire("a") {
            Decision::Denied { wait } => assert_eq!(wait, Duration::from_millis(250)),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn tokens_never_exceed_burst() {
        let (limiter, clock) = limiter(100.0, 3);
        assert!(limiter.allow("a"));
        clock.advance(Duration::from_secs(3600));
        assert_eq!(limiter.available("a"), Some(3.0));
        for _ in 0..3 {
            assert!(limiter.allow("a"));
        }
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn clients_are_independent() {
        let (limiter, _clock) = limiter(1.0, 1);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn remaining_counts_down() {
        let (limiter, _clock) = limiter(1.0, 3);
        assert_eq!(limiter.acquire("a"), Decision::Allowed { remaining: 2 });
        assert_eq!(limiter.acquire("a"), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.acquire("a"), Decision::Allowed { remaining: 0 });
    }

    #[test]
    fn evicts_only_full_and_idle_buckets() {
        let (limiter, clock) = limiter(1.0, 10);
        assert!(limiter.allow("drained"));
        for _ in 0..10 {
            limiter.allow("hammered");
        }

        clock.advance(Duration::from_secs(5));
        assert!(limiter.allow("recent"));
        // drained has refilled 5s * 1/s = back to 10 (full); hammered has 5.
        assert_eq!(limiter.evict_idle(Duration::from_secs(5)), 1);
        assert!(limiter.available("drained").is_none());
        assert!(limiter.available("hammered").is_some());
        assert!(limiter.available("recent").is_some(), "not idle long enough");
    }

    #[test]
    fn update_limits_clamps_existing_buckets() {
        let (limiter, _clock) = limiter(1.0, 10);
        assert!(limiter.allow("a"));
        limiter.update_limits(1.0, 2);
        assert_eq!(limiter.available("a"), Some(2.0));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn clock_going_backwards_does_not_refill_negatively() {
        #[derive(Debug)]
        struct Backwards(std::sync::atomic::AtomicU64);
        impl Clock for Backwards {
            fn now_millis(&self) -> u64 {
                self.0.fetch_sub(10, std::sync::atomic::Ordering::SeqCst)
            }
        }
        let limiter =
            TokenBucketLimiter::with_clock(1.0, 2, Arc::new(Backwards(1_000.into())));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        let tokens = limiter.available("a").unwrap();
        assert!((0.0..=2.0).contains(&tokens));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_callers_never_over_admit() {
        let (limiter, _clock) = limiter(1.0, 50);
        let limiter = Arc::new(limiter);
        let barrier = Arc::new(tokio::sync::Barrier::new(100));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    limiter.allow("shared")
                })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().expect("join"))
            .count();
        assert_eq!(admitted, 50);
    }
}
