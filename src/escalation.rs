//! Escalation from repeated failures to temporary bans.
//!
//! A pure function of the failure count: no clock, no I/O. The table is
//! ascending by threshold and the highest tier met wins, so a policy of
//! `[(5, 5m), (20, 1h)]` bans for five minutes at five failures and for an
//! hour at twenty.
//!
//! ```rust
//! use std::time::Duration;
//! use portcullis::EscalationPolicy;
//!
//! let policy = EscalationPolicy::default();
//! assert!(!policy.evaluate(4, Duration::from_secs(300)).should_ban);
//! let verdict = policy.evaluate(5, Duration::from_secs(300));
//! assert!(verdict.should_ban);
//! assert_eq!(verdict.ban_duration, Duration::from_secs(300));
//! assert_eq!(verdict.reason, "too_many_failed_logins");
//! ```

use std::time::Duration;

use crate::config::GateConfig;

/// Reason attached to bans raised by the login escalation tier.
pub const TOO_MANY_FAILED_LOGINS: &str = "too_many_failed_logins";

/// Errors produced when building an escalation table.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("escalation table must have at least one tier")]
    Empty,
    #[error("tier {index}: threshold must be > 0")]
    ZeroThreshold { index: usize },
    #[error("tier {index}: ban duration must be > 0")]
    ZeroDuration { index: usize },
    #[error("tier {index}: threshold {threshold} does not exceed previous tier ({previous})")]
    NotAscending { index: usize, threshold: u32, previous: u32 },
}

/// One row of the escalation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    /// Failures (inclusive) at which this tier applies.
    pub threshold: u32,
    pub ban_duration: Duration,
}

/// Outcome of [`EscalationPolicy::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub should_ban: bool,
    /// Zero when `should_ban` is false.
    pub ban_duration: Duration,
    /// Empty when `should_ban` is false.
    pub reason: String,
}

impl Verdict {
    fn pass() -> Self {
        Self { should_ban: false, ban_duration: Duration::ZERO, reason: String::new() }
    }
}

/// Tiered failure-count policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationPolicy {
    tiers: Vec<Tier>,
    window: Duration,
    reason: String,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![Tier { threshold: 5, ban_duration: Duration::from_secs(300) }],
            window: Duration::from_secs(300),
            reason: TOO_MANY_FAILED_LOGINS.to_string(),
        }
    }
}

impl EscalationPolicy {
    /// Build a policy from `(threshold, duration)` tiers ordered by ascending threshold.
    pub fn new(
        tiers: impl IntoIterator<Item = (u32, Duration)>,
        window: Duration,
        reason: impl Into<String>,
    ) -> Result<Self, PolicyError> {
        let tiers: Vec<Tier> = tiers
            .into_iter()
            .map(|(threshold, ban_duration)| Tier { threshold, ban_duration })
            .collect();
        if tiers.is_empty() {
            return Err(PolicyError::Empty);
        }
        for (index, tier) in tiers.iter().enumerate() {
            if tier.threshold == 0 {
                return Err(PolicyError::ZeroThreshold { index });
            }
            if tier.ban_duration.is_zero() {
                return Err(PolicyError::ZeroDuration { index });
            }
            if index > 0 && tier.threshold <= tiers[index - 1].threshold {
                return Err(PolicyError::NotAscending {
                    index,
                    threshold: tier.threshold,
                    previous: tiers[index - 1].threshold,
                });
            }
        }
        Ok(Self { tiers, window, reason: reason.into() })
    }

    /// Single-tier login policy from configuration.
    pub fn from_config(config: &GateConfig) -> Result<Self, PolicyError> {
        Self::new(
            [(config.login_max_attempts, config.ban_duration())],
            config.login_window(),
            TOO_MANY_FAILED_LOGINS,
        )
    }

    /// Lookback window the caller should count failures over.
    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Decide whether `failed_attempts` counted over `window` warrants a ban.
    ///
    /// Counts taken over a window longer than the policy's are scaled down
    /// proportionally so a wider read cannot trip a ban the policy window
    /// would not.
    pub fn evaluate(&self, failed_attempts: u64, window: Duration) -> Verdict {
        let effective = if window > self.window && !window.is_zero() {
            let scaled = failed_attempts as f64 * self.window.as_secs_f64() / window.as_secs_f64();
            scaled.floor() as u64
        } else {
            failed_attempts
        };

        match self.tiers.iter().rev().find(|tier| effective >= u64::from(tier.threshold)) {
            Some(tier) => Verdict {
                should_ban: true,
                ban_duration: tier.ban_duration,
                reason: self.reason.clone(),
            },
            None => Verdict::pass(),
        }
    }
}
