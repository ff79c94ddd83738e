#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # portcullis
//!
//! Adaptive rate limiting and temporary IP bans for async services.
//!
//! ## Features
//!
//! - **Token buckets** per client, decided in memory on every request
//! - **Durable window counters** written off the request path with bounded retries
//! - **Escalation** from repeated failures on critical endpoints to timed bans
//! - **Ban cache** backed by a [`DurableStore`], restored across restarts
//! - **Cleanup scheduler** for ban expiry, bucket eviction, archival and purges
//! - **Fail open**: a slow or unavailable store never denies legitimate traffic
//!
//! ## Quick Start
//!
//! ```rust
//! use portcullis::{GateBuilder, GateConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let gate = GateBuilder::new().config(GateConfig::default()).build().unwrap();
//!     gate.start().await;
//!
//!     let admission = gate.admit("203.0.113.7", "/api/auth/login", true).await.unwrap();
//!     if admission.allowed {
//!         // check credentials, then report the outcome
//!         gate.report_login("203.0.113.7", "/api/auth/login", "alice", false, Some("invalid_password"))
//!             .unwrap();
//!     }
//!
//!     gate.shutdown().await;
//! }
//! ```

pub mod audit;
pub mod ban;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod gate;
pub mod limiter;
pub mod middleware;
pub mod model;
pub mod retry;
pub mod store;
pub mod window;

// Re-exports
pub use audit::{AuditError, AuditEvent, AuditSink, MemoryAuditSink, NonBlockingAudit, TracingAuditSink};
pub use ban::{BanManager, BanStatus};
pub use cleanup::{CleanupReport, CleanupScheduler, CleanupTask, TaskOutcome};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, GateConfig, SharedConfig};
pub use dispatch::{DispatchStats, WriteDispatcher, WriteOp};
pub use error::{GateError, StoreError};
pub use escalation::{EscalationPolicy, PolicyError, Tier, Verdict, TOO_MANY_FAILED_LOGINS};
pub use gate::{Admission, Denial, GateBuilder, RequestGate, RATE_LIMIT_EXCEEDED, REASON_OK};
pub use limiter::{Decision, TokenBucketLimiter};
pub use middleware::{GateLayer, GateRequest, GateService, GateServiceError};
pub use model::{Ban, LoginAttemptRecord, RateWindow, RequestOutcome, WindowCounts};
pub use retry::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper, WriteRetry};
pub use store::{DurableStore, InMemoryStore};
pub use window::WindowCounterStore;
