//! Bounded retry for background durable writes.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only transient [`StoreError`]s are retried; permanent ones return at once.
//! - Retry `n` (1-indexed) waits `min(base * 2^(n-1), max_delay)`, randomized
//!   with full jitter to `[0, delay]` unless jitter is disabled.
//! - The [`Sleeper`] decides how delays are applied; tests inject
//!   [`InstantSleeper`] or [`TrackingSleeper`].
//!
//! ```rust
//! use std::time::Duration;
//! use portcullis::{InstantSleeper, StoreError, WriteRetry};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retry = WriteRetry::new(3, Duration::from_millis(50)).with_sleeper(InstantSleeper);
//! let mut calls = 0;
//! let result: Result<(), StoreError> = retry
//!     .execute(|| {
//!         calls += 1;
//!         async { Err(StoreError::Unavailable("down".into())) }
//!     })
//!     .await;
//! assert!(result.is_err());
//! assert_eq!(calls, 3);
//! # });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::{rng, Rng};

use crate::clock::millis;
use crate::error::StoreError;

/// Upper bound on a single backoff delay when none is configured.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Abstraction for sleeping between attempts.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        Box::pin(async {})
    }
}

/// Capped exponential backoff with optional full jitter.
#[derive(Debug, Clone)]
pub struct WriteRetry {
    max_attempts: usize,
    base: Duration,
    max_delay: Duration,
    jitter: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl WriteRetry {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: usize, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max_delay: DEFAULT_MAX_DELAY.max(base),
            jitter: true,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base);
        self
    }

    /// Disable jitter; delays become deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Un-jittered delay before retry `attempt` (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = u32::try_from(attempt - 1).unwrap_or(u32::MAX).min(63);
        let factor = 1u64 << shift;
        let delay = millis(self.base).saturating_mul(factor);
        Duration::from_millis(delay).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let ms = millis(delay);
        if !self.jitter || ms == 0 {
            return delay;
        }
        Duration::from_millis(rng().random_range(0..=ms))
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
        Op: FnMut() -> Fut,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.jittered(self.delay(attempt));
                    tracing::debug!(
                        target: "portcullis::window",
                        attempt,
                        ?delay,
                        error = %err,
                        "retrying durable write"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
