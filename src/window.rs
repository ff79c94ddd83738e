//! Durable time-windowed counters.
//!
//! Writes are fire-and-forget through the [`WriteDispatcher`]; reads go
//! straight to the [`DurableStore`] and are the caller's to bound.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::dispatch::{DispatchStats, WriteDispatcher, WriteOp};
use crate::error::StoreError;
use crate::model::{window_start, LoginAttemptRecord, RequestOutcome, WindowCounts};
use crate::store::DurableStore;

/// Request, failure and throttle counters per `(client, endpoint, window)`.
#[derive(Debug, Clone)]
pub struct WindowCounterStore {
    store: Arc<dyn DurableStore>,
    writes: WriteDispatcher,
    clock: Arc<dyn Clock>,
    granularity: Duration,
}

impl WindowCounterStore {
    pub fn new(
        store: Arc<dyn DurableStore>,
        writes: WriteDispatcher,
        clock: Arc<dyn Clock>,
        granularity: Duration,
    ) -> Self {
        Self { store, writes, clock, granularity }
    }

    fn enqueue(&self, client_id: &str, endpoint: &str, outcome: RequestOutcome) {
        let op = WriteOp::Window {
            client_id: client_id.to_string(),
            endpoint: endpoint.to_string(),
            window_start: window_start(self.clock.now_millis(), self.granularity),
            outcome,
        };
        self.writes.submit(op);
    }

    /// Count a completed request in the current window.
    pub fn record_request(&self, client_id: &str, endpoint: &str, success: bool) {
        self.enqueue(client_id, endpoint, RequestOutcome::from_success(success));
    }

    /// Count a request denied by the token bucket.
    pub fn record_throttled(&self, client_id: &str, endpoint: &str) {
        self.enqueue(client_id, endpoint, RequestOutcome::Throttled);
    }

    /// Append an authentication attempt.
    pub fn record_login_attempt(&self, record: LoginAttemptRecord) {
        self.writes.submit(WriteOp::LoginAttempt(record));
    }

    /// Totals over every window that starts at or after `since`, rounded
    /// down to the window boundary.
    pub async fn counts_in_window(
        &self,
        client_id: &str,
        endpoint: &str,
        since: u64,
    ) -> Result<WindowCounts, StoreError> {
        let from = window_start(since, self.granularity);
        self.store.count_window(client_id, endpoint, from).await
    }

    /// Requests since `since`.
    pub async fn count_in_window(
        &self,
        client_id: &str,
        endpoint: &str,
        since: u64,
    ) -> Result<u64, StoreError> {
        Ok(self.counts_in_window(client_id, endpoint, since).await?.requests)
    }

    /// Failed requests since `since`.
    pub async fn failures_in_window(
        &self,
        client_id: &str,
        endpoint: &str,
        since: u64,
    ) -> Result<u64, StoreError> {
        Ok(self.counts_in_window(client_id, endpoint, since).await?.failures)
    }

    /// Wait for every write queued so far.
    pub async fn flush(&self) {
        self.writes.flush().await;
    }

    pub fn write_stats(&self) -> DispatchStats {
        self.writes.stats()
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }
}
