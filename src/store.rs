//! Durable storage collaborator.
//!
//! [`DurableStore`] is what the window counters, the ban cache and the
//! cleanup scheduler persist through. [`InMemoryStore`] is the default and
//! the test double: every operation runs under one lock, and it can be made
//! unavailable or slow to exercise the fail-open paths. Production
//! deployments plug in `portcullis-sqlite`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Ban, LoginAttemptRecord, RateWindow, RequestOutcome, WindowCounts};

/// Durable state behind the window counters and the ban cache.
///
/// Implementations must make `increment_window` an atomic upsert: concurrent
/// increments of the same `(client_id, endpoint, window_start)` never lose
/// counts and never create a second row. At most one unreleased ban exists per
/// address; `upsert_ban` overwrites it in place.
///
/// Timestamps are epoch milliseconds.
#[async_trait]
pub trait DurableStore: Send + Sync + std::fmt::Debug {
    /// Count one request in the window starting at `window_start`.
    async fn increment_window(
        &self,
        client_id: &str,
        endpoint: &str,
        window_start: u64,
        outcome: RequestOutcome,
    ) -> Result<(), StoreError>;

    /// Sum the live windows with `window_start >= since`.
    async fn count_window(
        &self,
        client_id: &str,
        endpoint: &str,
        since: u64,
    ) -> Result<WindowCounts, StoreError>;

    async fn append_login_attempt(&self, record: LoginAttemptRecord) -> Result<(), StoreError>;

    /// Insert a ban, or overwrite the unreleased ban for the same address.
    async fn upsert_ban(&self, ban: &Ban) -> Result<(), StoreError>;

    /// Release the unreleased ban for `ip_address`, returning the released record.
    async fn release_ban(
        &self,
        ip_address: &str,
        at: u64,
        released_by: &str,
        automatic: bool,
    ) -> Result<Option<Ban>, StoreError>;

    /// Unreleased bans with `banned_until > now`.
    async fn active_bans(&self, now: u64) -> Result<Vec<Ban>, StoreError>;

    /// Auto-release every unreleased ban with `banned_until <= now`.
    async fn release_expired_bans(&self, now: u64) -> Result<Vec<Ban>, StoreError>;

    /// Move windows with `window_start < cutoff` to the archive. Returns rows moved.
    async fn archive_windows_before(&self, cutoff: u64) -> Result<u64, StoreError>;

    async fn purge_login_attempts_before(&self, cutoff: u64) -> Result<u64, StoreError>;

    /// Delete released bans with `released_at < cutoff`. Active bans are kept.
    async fn purge_released_bans_before(&self, cutoff: u64) -> Result<u64, StoreError>;
}

type WindowKey = (String, String, u64);

#[derive(Debug, Default)]
struct Tables {
    windows: HashMap<WindowKey, RateWindow>,
    archive: Vec<RateWindow>,
    login_attempts: Vec<LoginAttemptRecord>,
    bans: Vec<Ban>,
}

/// In-process store. Every operation runs under one lock, which makes the
/// window upsert atomic.
///
/// Also a test double: [`set_available`](Self::set_available) simulates an
/// outage and [`set_latency`](Self::set_latency) a slow backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    unavailable: Arc<AtomicBool>,
    latency_millis: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When `false`, every operation fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every operation by `latency` before touching the tables.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_millis.store(ms, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        let latency = self.latency_millis.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(self.lock())
    }

    /// Snapshot of live window rows, sorted by key.
    pub fn windows(&self) -> Vec<RateWindow> {
        let mut rows: Vec<_> = self.lock().windows.values().cloned().collect();
        rows.sort_by(|a, b| {
            (&a.client_id, &a.endpoint, a.window_start).cmp(&(&b.client_id, &b.endpoint, b.window_start))
        });
        rows
    }

    pub fn archived_windows(&self) -> Vec<RateWindow> {
        self.lock().archive.clone()
    }

    pub fn login_attempts(&self) -> Vec<LoginAttemptRecord> {
        self.lock().login_attempts.clone()
    }

    /// Every ban record, released ones included, in insertion order.
    pub fn bans(&self) -> Vec<Ban> {
        self.lock().bans.clone()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn increment_window(
        &self,
        client_id: &str,
        endpoint: &str,
        window_start: u64,
        outcome: RequestOutcome,
    ) -> Result<(), StoreError> {
        let mut tables = self.enter().await?;
        tables
            .windows
            .entry((client_id.to_string(), endpoint.to_string(), window_start))
            .or_insert_with(|| RateWindow::new(client_id, endpoint, window_start))
            .apply(outcome);
        Ok(())
    }

    async fn count_window(
        &self,
        client_id: &str,
        endpoint: &str,
        since: u64,
    ) -> Result<WindowCounts, StoreError> {
        let tables = self.enter().await?;
        let counts = tables
            .windows
            .values()
            .filter(|w| w.client_id == client_id && w.endpoint == endpoint && w.window_start >= since)
            .fold(WindowCounts::default(), |acc, w| WindowCounts {
                requests: acc.requests + w.request_count,
                failures: acc.failures + w.failure_count,
                throttled: acc.throttled + w.throttled_count,
            });
        Ok(counts)
    }

    async fn append_login_attempt(&self, record: LoginAttemptRecord) -> Result<(), StoreError> {
        self.enter().await?.login_attempts.push(record);
        Ok(())
    }

    async fn upsert_ban(&self, ban: &Ban) -> Result<(), StoreError> {
        let mut tables = self.enter().await?;
        match tables
            .bans
            .iter_mut()
            .find(|b| b.ip_address == ban.ip_address && b.released_at.is_none())
        {
            Some(existing) => *existing = ban.clone(),
            None => tables.bans.push(ban.clone()),
        }
        Ok(())
    }

    async fn release_ban(
        &self,
        ip_address: &str,
        at: u64,
        released_by: &str,
        automatic: bool,
    ) -> Result<Option<Ban>, StoreError> {
        let mut tables = self.enter().await?;
        let released = tables
            .bans
            .iter_mut()
            .find(|b| b.ip_address == ip_address && b.released_at.is_none())
            .map(|b| {
                b.release(at, released_by, automatic);
                b.clone()
            });
        Ok(released)
    }

    async fn active_bans(&self, now: u64) -> Result<Vec<Ban>, StoreError> {
        let tables = self.enter().await?;
        Ok(tables.bans.iter().filter(|b| b.is_active(now)).cloned().collect())
    }

    async fn release_expired_bans(&self, now: u64) -> Result<Vec<Ban>, StoreError> {
        let mut tables = self.enter().await?;
        let mut released = Vec::new();
        for ban in tables.bans.iter_mut() {
            if ban.released_at.is_none() && ban.banned_until <= now {
                ban.release(now, "system", true);
                released.push(ban.clone());
            }
        }
        Ok(released)
    }

    async fn archive_windows_before(&self, cutoff: u64) -> Result<u64, StoreError> {
        let mut tables = self.enter().await?;
        let stale: Vec<WindowKey> =
            tables.windows.keys().filter(|(_, _, start)| *start < cutoff).cloned().collect();
        for key in &stale {
            if let Some(row) = tables.windows.remove(key) {
                tables.archive.push(row);
            }
        }
        Ok(stale.len() as u64)
    }

    async fn purge_login_attempts_before(&self, cutoff: u64) -> Result<u64, StoreError> {
        let mut tables = self.enter().await?;
        let before = tables.login_attempts.len();
        tables.login_attempts.retain(|a| a.timestamp >= cutoff);
        Ok((before - tables.login_attempts.len()) as u64)
    }

    async fn purge_released_bans_before(&self, cutoff: u64) -> Result<u64, StoreError> {
        let mut tables = self.enter().await?;
        let before = tables.bans.len();
        tables.bans.retain(|b| b.released_at.map_or(true, |at| at >= cutoff));
        Ok((before - tables.bans.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ban(ip: &str, at: u64, until: u64) -> Ban {
        Ban {
            ip_address: ip.into(),
            banned_at: at,
            banned_until: until,
            reason: "test".into(),
            failed_attempts: 5,
            banned_by: "system".into(),
            released_at: None,
            released_by: None,
            auto_released: false,
        }
    }

    #[tokio::test]
    async fn increments_upsert_one_row_per_window() {
        let store = InMemoryStore::new();
        store.increment_window("c", "/login", 0, RequestOutcome::Succeeded).await.unwrap();
        store.increment_window("c", "/login", 0, RequestOutcome::Failed).await.unwrap();
        store.increment_window("c", "/login", 60_000, RequestOutcome::Throttled).await.unwrap();
        store.increment_window("c", "/other", 0, RequestOutcome::Failed).await.unwrap();

        let rows = store.windows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].request_count, 2);
        assert_eq!(rows[0].failure_count, 1);

        let counts = store.count_window("c", "/login", 0).await.unwrap();
        assert_eq!(counts, WindowCounts { requests: 3, failures: 1, throttled: 1 });
        let recent = store.count_window("c", "/login", 60_000).await.unwrap();
        assert_eq!(recent.requests, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let store = InMemoryStore::new();
        let tasks = (0..200).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store.increment_window("c", "/e", 0, RequestOutcome::Succeeded).await
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }
        assert_eq!(store.windows().len(), 1);
        assert_eq!(store.windows()[0].request_count, 200);
    }

    #[tokio::test]
    async fn upsert_ban_keeps_one_unreleased_record() {
        let store = InMemoryStore::new();
        store.upsert_ban(&ban("1.1.1.1", 0, 100)).await.unwrap();
        store.upsert_ban(&ban("1.1.1.1", 0, 500)).await.unwrap();
        assert_eq!(store.bans().len(), 1);
        assert_eq!(store.bans()[0].banned_until, 500);

        let released = store.release_ban("1.1.1.1", 50, "admin", false).await.unwrap();
        assert_eq!(released.and_then(|b| b.released_by), Some("admin".into()));
        assert!(store.release_ban("1.1.1.1", 60, "admin", false).await.unwrap().is_none());

        store.upsert_ban(&ban("1.1.1.1", 70, 900)).await.unwrap();
        assert_eq!(store.bans().len(), 2, "released record is kept as history");
        assert_eq!(store.active_bans(80).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_bans_are_auto_released() {
        let store = InMemoryStore::new();
        store.upsert_ban(&ban("a", 0, 100)).await.unwrap();
        store.upsert_ban(&ban("b", 0, 1_000)).await.unwrap();

        let released = store.release_expired_bans(100).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].ip_address, "a");
        assert!(released[0].auto_released);
        assert_eq!(released[0].released_at, Some(100));
        assert_eq!(store.active_bans(100).await.unwrap()[0].ip_address, "b");
    }

    #[tokio::test]
    async fn archive_and_purge_respect_cutoffs() {
        let store = InMemoryStore::new();
        store.increment_window("c", "/e", 0, RequestOutcome::Succeeded).await.unwrap();
        store.increment_window("c", "/e", 10_000, RequestOutcome::Succeeded).await.unwrap();
        assert_eq!(store.archive_windows_before(10_000).await.unwrap(), 1);
        assert_eq!(store.windows().len(), 1);
        assert_eq!(store.archived_windows()[0].window_start, 0);

        for ts in [5, 15] {
            store
                .append_login_attempt(LoginAttemptRecord {
                    username: "u".into(),
                    ip_address: "c".into(),
                    success: false,
                    failure_reason: None,
                    rate_limited: false,
                    timestamp: ts,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.purge_login_attempts_before(10).await.unwrap(), 1);
        assert_eq!(store.login_attempts()[0].timestamp, 15);

        store.upsert_ban(&ban("old", 0, 10)).await.unwrap();
        store.release_ban("old", 5, "admin", false).await.unwrap();
        store.upsert_ban(&ban("live", 0, 1_000)).await.unwrap();
        assert_eq!(store.purge_released_bans_before(6).await.unwrap(), 1);
        assert_eq!(store.bans().len(), 1);
        assert_eq!(store.bans()[0].ip_address, "live");
    }

    #[tokio::test]
    async fn outage_switch_fails_every_operation() {
        let store = InMemoryStore::new();
        store.set_available(false);
        let err = store.count_window("c", "/e", 0).await.unwrap_err();
        assert!(err.is_transient());
        store.set_available(true);
        assert!(store.count_window("c", "/e", 0).await.is_ok());
    }
}
