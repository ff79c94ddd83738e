//! Admission orchestration.
//!
//! Per client the gate is a two-state machine, `Normal -> Banned -> Normal`.
//! Only critical endpoints can move a client to `Banned` (through the
//! escalation policy); a ban ends lazily at expiry or by administrative
//! release. Non-critical endpoints are only throttled.
//!
//! `admit` decides in this order:
//! 1. active ban: deny with the ban's remaining time and reason;
//! 2. empty token bucket: count a throttle and deny `rate_limit_exceeded`;
//! 3. critical endpoint: read recent failures (bounded by
//!    `criticalReadTimeoutMillis`); if the policy bans, ban and deny;
//!    on a store error or timeout admit anyway;
//! 4. admit.
//!
//! ```rust
//! use portcullis::{GateBuilder, GateConfig, RATE_LIMIT_EXCEEDED};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = GateConfig { global_burst: 2, ..GateConfig::default() };
//! let gate = GateBuilder::new().config(config).build().unwrap();
//!
//! assert!(gate.admit("203.0.113.9", "/api/products", false).await.unwrap().allowed);
//! assert!(gate.admit("203.0.113.9", "/api/products", false).await.unwrap().allowed);
//! let denied = gate.admit("203.0.113.9", "/api/products", false).await.unwrap();
//! assert_eq!(denied.reason, RATE_LIMIT_EXCEEDED);
//! # });
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::audit::{AuditEvent, AuditSink, NonBlockingAudit, TracingAuditSink, SYSTEM_ACTOR};
use crate::ban::BanManager;
use crate::cleanup::CleanupScheduler;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{GateConfig, SharedConfig};
use crate::dispatch::WriteDispatcher;
use crate::error::GateError;
use crate::escalation::EscalationPolicy;
use crate::limiter::{Decision, TokenBucketLimiter};
use crate::model::{validate_client_id, window_ceil, Ban, LoginAttemptRecord};
use crate::retry::WriteRetry;
use crate::store::{DurableStore, InMemoryStore};
use crate::window::WindowCounterStore;

/// Reason on an admitted request.
pub const REASON_OK: &str = "ok";
/// Reason on a request denied by the token bucket.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// The gate's answer for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub allowed: bool,
    /// When the client may try again; `None` when admitted.
    pub retry_after: Option<Duration>,
    /// `ok`, `rate_limit_exceeded`, or the ban reason.
    pub reason: String,
}

impl Admission {
    fn admitted() -> Self {
        Self { allowed: true, retry_after: None, reason: REASON_OK.into() }
    }

    fn rate_limited(wait: Duration) -> Self {
        Self { allowed: false, retry_after: Some(wait), reason: RATE_LIMIT_EXCEEDED.into() }
    }

    fn banned(remaining: Duration, reason: impl Into<String>) -> Self {
        Self { allowed: false, retry_after: Some(remaining), reason: reason.into() }
    }

    /// Why the request was denied; `None` if admitted.
    pub fn denial(&self) -> Option<Denial> {
        if self.allowed {
            return None;
        }
        let retry_after = self.retry_after.unwrap_or_default();
        if self.reason == RATE_LIMIT_EXCEEDED {
            Some(Denial::RateLimited { retry_after })
        } else {
            Some(Denial::Banned { reason: self.reason.clone(), retry_after })
        }
    }
}

/// Client-facing classification of a denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    RateLimited { retry_after: Duration },
    Banned { reason: String, retry_after: Duration },
}

impl Denial {
    /// Whole seconds to advertise in `Retry-After`, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let d = match self {
            Denial::RateLimited { retry_after } | Denial::Banned { retry_after, .. } => *retry_after,
        };
        d.as_secs() + u64::from(d.subsec_nanos() > 0)
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::RateLimited { .. } => write!(f, "rate limit exceeded"),
            Denial::Banned { .. } => {
                write!(f, "temporarily banned, retry after {} seconds", self.retry_after_secs())
            }
        }
    }
}

/// Rate limiting and ban enforcement for one process.
#[derive(Debug)]
pub struct RequestGate {
    limiter: Arc<TokenBucketLimiter>,
    windows: WindowCounterStore,
    bans: Arc<BanManager>,
    policy: ArcSwap<EscalationPolicy>,
    config: SharedConfig,
    clock: Arc<dyn Clock>,
    audit: NonBlockingAudit,
    scheduler: CleanupScheduler,
}

impl RequestGate {
    /// Shortcut for [`GateBuilder::new`].
    pub fn builder() -> GateBuilder {
        GateBuilder::new()
    }

    /// Decide whether a request from `client_id` to `endpoint` may proceed.
    ///
    /// Errors only on a malformed client id; denials are `Ok` admissions.
    pub async fn admit(
        &self,
        client_id: &str,
        endpoint: &str,
        critical: bool,
    ) -> Result<Admission, GateError> {
        validate_client_id(client_id)?;

        let status = self.bans.is_banned(client_id);
        if status.banned {
            let reason = status.reason.unwrap_or_default();
            tracing::debug!(target: "portcullis::gate", client = client_id, endpoint, %reason, "denied: banned");
            return Ok(Admission::banned(status.remaining, reason));
        }

        if let Decision::Denied { wait } = self.limiter.acquire(client_id) {
            self.windows.record_throttled(client_id, endpoint);
            tracing::debug!(target: "portcullis::gate", client = client_id, endpoint, ?wait, "denied: rate limited");
            return Ok(Admission::rate_limited(wait));
        }

        if !critical {
            self.windows.record_request(client_id, endpoint, true);
            return Ok(Admission::admitted());
        }

        if let Some(ban) = self.escalate(client_id, endpoint).await {
            let now = self.clock.now_millis();
            self.audit.emit(AuditEvent {
                actor_id: SYSTEM_ACTOR.into(),
                action: "access_denied".into(),
                entity_type: "endpoint".into(),
                entity_id: endpoint.to_string(),
                old_values: None,
                new_values: Some(serde_json::json!({ "client": client_id, "reason": ban.reason })),
                client_context: Some(client_id.to_string()),
                at_millis: now,
            });
            return Ok(Admission::banned(ban.remaining(now), ban.reason));
        }
        Ok(Admission::admitted())
    }

    /// Bounded failure read plus policy evaluation. `Some` if the client was banned.
    async fn escalate(&self, client_id: &str, endpoint: &str) -> Option<Ban> {
        let config = self.config.get();
        let policy = self.policy.load_full();
        let window = policy.window();
        let mut since = self.clock.now_millis().saturating_sub(crate::clock::millis(window));
        // windows are counted whole, so skip the one the previous ban ended in
        if let Some(floor) = self.bans.escalation_floor(client_id) {
            since = since.max(window_ceil(floor, self.windows.granularity()));
        }

        let read = self.windows.failures_in_window(client_id, endpoint, since);
        let failures = match tokio::time::timeout(config.critical_read_timeout(), read).await {
            Ok(Ok(failures)) => failures,
            Ok(Err(err)) => {
                tracing::warn!(target: "portcullis::gate", client = client_id, endpoint, error = %err, "failure count unavailable, failing open");
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    target: "portcullis::gate",
                    client = client_id,
                    endpoint,
                    timeout = ?config.critical_read_timeout(),
                    "failure count timed out, failing open"
                );
                return None;
            }
        };

        let verdict = policy.evaluate(failures, window);
        if !verdict.should_ban {
            return None;
        }
        let attempts = u32::try_from(failures).unwrap_or(u32::MAX);
        match self.bans.ban(client_id, &verdict.reason, verdict.ban_duration, attempts, SYSTEM_ACTOR) {
            Ok(ban) => Some(ban),
            Err(err) => {
                tracing::warn!(target: "portcullis::gate", client = client_id, error = %err, "escalation ban rejected");
                None
            }
        }
    }

    /// Record the outcome of an authentication attempt on a critical endpoint.
    ///
    /// Counts the request (and the failure) in the current window and appends a
    /// login attempt record. Both writes are queued, not awaited.
    pub fn report_login(
        &self,
        client_id: &str,
        endpoint: &str,
        username: &str,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Result<(), GateError> {
        validate_client_id(client_id)?;
        self.windows.record_request(client_id, endpoint, success);
        self.windows.record_login_attempt(LoginAttemptRecord {
            username: username.to_string(),
            ip_address: client_id.to_string(),
            success,
            failure_reason: if success { None } else { failure_reason.map(str::to_string) },
            rate_limited: false,
            timestamp: self.clock.now_millis(),
        });
        Ok(())
    }

    /// Record a login attempt that was refused by `admit` before reaching the
    /// credential check. It does not count as a failed login.
    pub fn report_refused_login(
        &self,
        client_id: &str,
        username: &str,
        admission: &Admission,
    ) -> Result<(), GateError> {
        validate_client_id(client_id)?;
        self.windows.record_login_attempt(LoginAttemptRecord {
            username: username.to_string(),
            ip_address: client_id.to_string(),
            success: false,
            failure_reason: Some(admission.reason.clone()),
            rate_limited: admission.reason == RATE_LIMIT_EXCEEDED,
            timestamp: self.clock.now_millis(),
        });
        Ok(())
    }

    /// Record the outcome of a non-login request on a critical endpoint.
    pub fn report_outcome(&self, client_id: &str, endpoint: &str, success: bool) -> Result<(), GateError> {
        validate_client_id(client_id)?;
        self.windows.record_request(client_id, endpoint, success);
        Ok(())
    }

    /// Active bans, sorted by address.
    pub fn list_banned_clients(&self) -> Vec<Ban> {
        self.bans.list_active()
    }

    /// Administrative release. Releasing a client that is not banned is a no-op.
    pub fn release_client(&self, client_id: &str, actor: &str, reason: &str) -> Result<(), GateError> {
        let released = self.bans.unban_with_note(client_id, actor, Some(reason))?;
        if released.is_none() {
            tracing::debug!(target: "portcullis::gate", client = client_id, actor, "release requested for client that is not banned");
        }
        Ok(())
    }

    /// Swap in a new configuration. Limiter and escalation pick it up at once;
    /// the scheduler picks up cadences on its next tick.
    pub fn reconfigure(&self, config: GateConfig) -> Result<(), GateError> {
        config.validate()?;
        let policy = EscalationPolicy::from_config(&config)?;
        self.limiter.update_limits(config.global_rate_per_second, config.global_burst);
        self.policy.store(Arc::new(policy));
        self.config.set(config)?;
        tracing::info!(target: "portcullis::gate", "configuration updated");
        Ok(())
    }

    /// Load persisted bans and start the cleanup loop.
    ///
    /// A store that cannot be read is logged; the gate starts with an empty
    /// ban cache and the scheduler keeps retrying the load.
    pub async fn start(&self) {
        match self.bans.restore_from_store().await {
            Ok(restored) => {
                tracing::info!(target: "portcullis::gate", restored, "ban cache restored");
            }
            Err(err) => {
                tracing::warn!(target: "portcullis::gate", error = %err, "could not restore bans, starting empty");
            }
        }
        self.scheduler.start();
    }

    /// Stop the cleanup loop and drain queued writes and audit events.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.flush().await;
    }

    /// Wait until queued durable writes and audit events have been processed.
    pub async fn flush(&self) {
        self.windows.flush().await;
        self.audit.flush().await;
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    pub fn bans(&self) -> &Arc<BanManager> {
        &self.bans
    }

    pub fn windows(&self) -> &WindowCounterStore {
        &self.windows
    }

    pub fn scheduler(&self) -> &CleanupScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> Arc<GateConfig> {
        self.config.get()
    }

    pub fn policy(&self) -> Arc<EscalationPolicy> {
        self.policy.load_full()
    }

    pub fn audit(&self) -> &NonBlockingAudit {
        &self.audit
    }
}

/// Wires a [`RequestGate`] from its collaborators.
pub struct GateBuilder {
    config: GateConfig,
    policy: Option<EscalationPolicy>,
    store: Option<Arc<dyn DurableStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
    retry: Option<WriteRetry>,
}

impl Default for GateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GateBuilder {
    /// Defaults: [`GateConfig::default`], an [`InMemoryStore`], a
    /// [`TracingAuditSink`] and the monotonic clock.
    pub fn new() -> Self {
        Self { config: GateConfig::default(), policy: None, store: None, audit: None, clock: None, retry: None }
    }

    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the single-tier policy derived from the config.
    pub fn policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the retry policy derived from `writeRetryAttempts`/`writeRetryBaseMillis`.
    pub fn write_retry(mut self, retry: WriteRetry) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Validate and assemble. Spawns the write and audit workers, so it must
    /// run inside a tokio runtime. Call [`RequestGate::start`] to begin cleanup.
    pub fn build(self) -> Result<RequestGate, GateError> {
        let config = SharedConfig::new(self.config)?;
        let snapshot = config.get();
        let policy = match self.policy {
            Some(policy) => policy,
            None => EscalationPolicy::from_config(&snapshot)?,
        };
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sink = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let retry = self
            .retry
            .unwrap_or_else(|| WriteRetry::new(snapshot.write_retry_attempts, snapshot.write_retry_base()));

        let writes = WriteDispatcher::spawn(store.clone(), retry, snapshot.write_queue_capacity);
        let audit = NonBlockingAudit::with_capacity(sink, snapshot.audit_queue_capacity);
        let limiter = Arc::new(TokenBucketLimiter::with_clock(
            snapshot.global_rate_per_second,
            snapshot.global_burst,
            clock.clone(),
        ));
        let windows =
            WindowCounterStore::new(store.clone(), writes.clone(), clock.clone(), snapshot.window_granularity());
        let bans = Arc::new(BanManager::new(store, writes, audit.clone(), clock.clone()));
        let scheduler = CleanupScheduler::new(limiter.clone(), bans.clone(), clock.clone(), config.clone());

        Ok(RequestGate {
            limiter,
            windows,
            bans,
            policy: ArcSwap::from_pointee(policy),
            config,
            clock,
            audit,
            scheduler,
        })
    }
}
