//! Records shared between the gate and durable storage.
//!
//! Timestamps are epoch milliseconds as produced by [`Clock`](crate::clock::Clock).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::remaining;
use crate::error::GateError;

/// Upper bound on client identifier length in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 256;

/// Reject identifiers that cannot be a sensible map/row key.
pub fn validate_client_id(client_id: &str) -> Result<(), GateError> {
    if client_id.is_empty() {
        return Err(GateError::InvalidClientId { reason: "empty" });
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(GateError::InvalidClientId { reason: "longer than 256 bytes" });
    }
    if client_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(GateError::InvalidClientId { reason: "contains whitespace or control characters" });
    }
    Ok(())
}

/// How a single request is counted in its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Admitted and completed normally.
    Succeeded,
    /// Admitted but failed (e.g. wrong password). Feeds escalation.
    Failed,
    /// Denied by the token bucket.
    Throttled,
}

impl RequestOutcome {
    /// Map a handler's success flag to an outcome.
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

/// Durable counter row. One per `(client_id, endpoint, window_start)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    pub client_id: String,
    pub endpoint: String,
    /// Start of the window, truncated to the configured granularity.
    pub window_start: u64,
    pub request_count: u64,
    pub failure_count: u64,
    pub throttled_count: u64,
}

impl RateWindow {
    /// Empty row for a window.
    pub fn new(client_id: impl Into<String>, endpoint: impl Into<String>, window_start: u64) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint: endpoint.into(),
            window_start,
            request_count: 0,
            failure_count: 0,
            throttled_count: 0,
        }
    }

    /// Count one request with the given outcome.
    pub fn apply(&mut self, outcome: RequestOutcome) {
        self.request_count = self.request_count.saturating_add(1);
        match outcome {
            RequestOutcome::Succeeded => {}
            RequestOutcome::Failed => self.failure_count = self.failure_count.saturating_add(1),
            RequestOutcome::Throttled => {
                self.throttled_count = self.throttled_count.saturating_add(1)
            }
        }
    }
}

/// Truncate `at` down to a multiple of `granularity`.
pub fn window_start(at: u64, granularity: Duration) -> u64 {
    let step = u64::try_from(granularity.as_millis()).unwrap_or(u64::MAX).max(1);
    at - at % step
}

/// First window boundary at or after `at`.
pub(crate) fn window_ceil(at: u64, granularity: Duration) -> u64 {
    let start = window_start(at, granularity);
    if start == at {
        at
    } else {
        let step = u64::try_from(granularity.as_millis()).unwrap_or(u64::MAX).max(1);
        start.saturating_add(step)
    }
}

/// Aggregate counts over a range of windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowCounts {
    pub requests: u64,
    pub failures: u64,
    pub throttled: u64,
}

/// A ban on one client identifier.
///
/// Active while `released_at` is unset and `banned_until` is in the future.
/// Once released the record is historical and never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ban {
    pub ip_address: String,
    pub banned_at: u64,
    pub banned_until: u64,
    pub reason: String,
    pub failed_attempts: u32,
    pub banned_by: String,
    pub released_at: Option<u64>,
    pub released_by: Option<String>,
    pub auto_released: bool,
}

impl Ban {
    /// Whether the ban still blocks traffic at `now`.
    pub fn is_active(&self, now: u64) -> bool {
        self.released_at.is_none() && self.banned_until > now
    }

    /// Time left at `now`; zero once expired or released.
    pub fn remaining(&self, now: u64) -> Duration {
        if self.released_at.is_some() {
            return Duration::ZERO;
        }
        remaining(now, self.banned_until)
    }

    /// Mark released. No-op on an already released record.
    pub(crate) fn release(&mut self, at: u64, by: &str, automatic: bool) {
        if self.released_at.is_some() {
            return;
        }
        self.released_at = Some(at);
        self.released_by = Some(by.to_string());
        self.auto_released = automatic;
    }
}

/// One authentication attempt, as appended to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginAttemptRecord {
    pub username: String,
    pub ip_address: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub rate_limited: bool,
    pub timestamp: u64,
}
