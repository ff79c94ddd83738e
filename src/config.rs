//! Gate configuration.
//!
//! `GateConfig` deserializes from camelCase JSON with every field defaulted,
//! so callers only spell out what they change:
//!
//! ```rust
//! use portcullis::GateConfig;
//!
//! let cfg = GateConfig::from_json_str(r#"{ "globalRatePerSecond": 100, "globalBurst": 200 }"#).unwrap();
//! assert_eq!(cfg.global_burst, 200);
//! assert_eq!(cfg.login_max_attempts, 5);
//! ```
//!
//! Durations are whole seconds (or milliseconds where the key says so).
//! [`SharedConfig`] holds the live value; reads are lock-free.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Errors produced when parsing or validating configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The JSON document could not be parsed.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A field is out of range.
    #[error("invalid config field `{field}`: {msg}")]
    Invalid {
        /// camelCase name of the field.
        field: &'static str,
        /// What is wrong.
        msg: String,
    },
}

/// Tunables for the gate, limiter, escalation, write path, and scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GateConfig {
    /// Token refill rate per client.
    pub global_rate_per_second: f64,
    /// Token bucket capacity per client.
    pub global_burst: u32,
    /// Failures within `login_window` that trigger a ban.
    pub login_max_attempts: u32,
    #[serde(alias = "loginWindow")]
    pub login_window_secs: u64,
    #[serde(alias = "banDuration")]
    pub ban_duration_secs: u64,
    /// Scheduler tick.
    #[serde(alias = "cleanupInterval")]
    pub cleanup_interval_secs: u64,
    /// Released bans are purged after this many days.
    pub retention_window_days: u64,
    pub window_granularity_secs: u64,
    /// Upper bound on the synchronous failure-count read for critical endpoints.
    pub critical_read_timeout_millis: u64,
    pub write_queue_capacity: usize,
    /// Total attempts per durable write, including the first.
    pub write_retry_attempts: usize,
    pub write_retry_base_millis: u64,
    pub audit_queue_capacity: usize,
    /// Fully recovered buckets idle this long are evicted.
    pub bucket_idle_secs: u64,
    pub ban_sweep_secs: u64,
    pub bucket_sweep_secs: u64,
    pub archive_sweep_secs: u64,
    /// Window rows older than this are moved to the archive.
    pub archive_after_days: u64,
    pub login_attempt_retention_days: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            global_rate_per_second: 10.0,
            global_burst: 20,
            login_max_attempts: 5,
            login_window_secs: 300,
            ban_duration_secs: 300,
            cleanup_interval_secs: 30,
            retention_window_days: 30,
            window_granularity_secs: 60,
            critical_read_timeout_millis: 250,
            write_queue_capacity: 4096,
            write_retry_attempts: 3,
            write_retry_base_millis: 50,
            audit_queue_capacity: 1024,
            bucket_idle_secs: 300,
            ban_sweep_secs: 30,
            bucket_sweep_secs: 300,
            archive_sweep_secs: 3600,
            archive_after_days: 7,
            login_attempt_retention_days: 90,
        }
    }
}

impl GateConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every field is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.global_rate_per_second.is_finite() || self.global_rate_per_second <= 0.0 {
            return Err(invalid(
                "globalRatePerSecond",
                format!("must be finite and > 0 (got {})", self.global_rate_per_second),
            ));
        }
        let positive: [(&'static str, u64); 13] = [
            ("globalBurst", u64::from(self.global_burst)),
            ("loginMaxAttempts", u64::from(self.login_max_attempts)),
            ("loginWindowSecs", self.login_window_secs),
            ("banDurationSecs", self.ban_duration_secs),
            ("cleanupIntervalSecs", self.cleanup_interval_secs),
            ("retentionWindowDays", self.retention_window_days),
            ("windowGranularitySecs", self.window_granularity_secs),
            ("criticalReadTimeoutMillis", self.critical_read_timeout_millis),
            ("bucketIdleSecs", self.bucket_idle_secs),
            ("banSweepSecs", self.ban_sweep_secs),
            ("bucketSweepSecs", self.bucket_sweep_secs),
            ("archiveSweepSecs", self.archive_sweep_secs),
            ("archiveAfterDays", self.archive_after_days),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be > 0".into()));
            }
        }
        if self.login_attempt_retention_days == 0 {
            return Err(invalid("loginAttemptRetentionDays", "must be > 0".into()));
        }
        if self.write_queue_capacity == 0 {
            return Err(invalid("writeQueueCapacity", "must be > 0".into()));
        }
        if self.audit_queue_capacity == 0 {
            return Err(invalid("auditQueueCapacity", "must be > 0".into()));
        }
        if self.write_retry_attempts == 0 {
            return Err(invalid("writeRetryAttempts", "must be > 0".into()));
        }
        Ok(())
    }

    pub fn login_window(&self) -> Duration {
        Duration::from_secs(self.login_window_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn window_granularity(&self) -> Duration {
        Duration::from_secs(self.window_granularity_secs)
    }

    pub fn critical_read_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_read_timeout_millis)
    }

    pub fn write_retry_base(&self) -> Duration {
        Duration::from_millis(self.write_retry_base_millis)
    }

    pub fn bucket_idle(&self) -> Duration {
        Duration::from_secs(self.bucket_idle_secs)
    }

    pub fn released_ban_retention(&self) -> Duration {
        Duration::from_secs(self.retention_window_days.saturating_mul(DAY_SECS))
    }

    pub fn archive_after(&self) -> Duration {
        Duration::from_secs(self.archive_after_days.saturating_mul(DAY_SECS))
    }

    pub fn login_attempt_retention(&self) -> Duration {
        Duration::from_secs(self.login_attempt_retention_days.saturating_mul(DAY_SECS))
    }
}

fn invalid(field: &'static str, msg: String) -> ConfigError {
    ConfigError::Invalid { field, msg }
}

/// Live configuration handle. Clones share the same value.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<GateConfig>>,
}

impl SharedConfig {
    /// Wrap a validated config.
    pub fn new(config: GateConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { inner: Arc::new(ArcSwap::from_pointee(config)) })
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<GateConfig> {
        self.inner.load_full()
    }

    /// Replace the value after validating it. The old value stays on error.
    pub fn set(&self, config: GateConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_baseline_policy() {
        let cfg = GateConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.login_max_attempts, 5);
        assert_eq!(cfg.login_window(), Duration::from_secs(300));
        assert_eq!(cfg.ban_duration(), Duration::from_secs(300));
        assert_eq!(cfg.archive_after(), Duration::from_secs(7 * DAY_SECS));
        assert_eq!(cfg.login_attempt_retention(), Duration::from_secs(90 * DAY_SECS));
        assert_eq!(cfg.released_ban_retention(), Duration::from_secs(30 * DAY_SECS));
    }

    #[test]
    fn parses_partial_json_with_aliases() {
        let cfg = GateConfig::from_json_str(
            r#"{"globalRatePerSecond": 100, "globalBurst": 200, "loginWindow": 60, "banDuration": 900}"#,
        )
        .unwrap();
        assert_eq!(cfg.global_rate_per_second, 100.0);
        assert_eq!(cfg.global_burst, 200);
        assert_eq!(cfg.login_window(), Duration::from_secs(60));
        assert_eq!(cfg.ban_duration(), Duration::from_secs(900));
        assert_eq!(cfg.window_granularity_secs, 60);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = GateConfig::from_json_str(r#"{"globalRatePerSecond": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "globalRatePerSecond", .. }));

        let err = GateConfig::from_json_str(r#"{"globalBurst": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "globalBurst", .. }));

        let err = GateConfig::from_json_str(r#"{"writeRetryAttempts": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "writeRetryAttempts", .. }));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = GateConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn shared_config_keeps_old_value_on_invalid_update() {
        let shared = SharedConfig::new(GateConfig::default()).unwrap();
        let other = shared.clone();

        let mut next = GateConfig::default();
        next.global_burst = 50;
        shared.set(next).unwrap();
        assert_eq!(other.get().global_burst, 50);

        let bad = GateConfig { global_rate_per_second: f64::NAN, ..GateConfig::default() };
        assert!(shared.set(bad).is_err());
        assert_eq!(other.get().global_burst, 50);
    }
}
