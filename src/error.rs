//! Error types for the gate and its storage collaborators.
//!
//! Denials are not errors: a throttled or banned request is an ordinary
//! [`Admission`](crate::gate::Admission). Errors here are either storage
//! failures (which the gate absorbs and logs) or invariant violations that the
//! caller must see.
use std::time::Duration;

use crate::config::ConfigError;
use crate::escalation::PolicyError;

/// Failure reported by a [`DurableStore`](crate::store::DurableStore).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached (connection refused, pool exhausted).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The operation did not complete in time.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The backend rejected the operation.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Errors surfaced to callers of the gate and ban manager.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GateError {
    /// The client identifier is empty, too long, or contains whitespace/control characters.
    #[error("invalid client id: {reason}")]
    InvalidClientId {
        /// What is wrong with the identifier.
        reason: &'static str,
    },
    /// Bans must last for a positive duration.
    #[error("ban duration must be > 0 (got {0:?})")]
    InvalidBanDuration(Duration),
    /// Ban reasons must be non-empty and must not collide with the gate's own
    /// `ok` / `rate_limit_exceeded` reasons.
    #[error("reserved or empty ban reason `{reason}`")]
    InvalidBanReason { reason: String },
    /// Configuration rejected by validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Escalation table rejected by validation.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// A storage operation the caller explicitly awaited failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
