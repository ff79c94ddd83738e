//! Periodic maintenance.
//!
//! The scheduler ticks every `cleanup_interval` and runs each sub-task whose
//! own cadence has elapsed since its last *successful* run:
//!
//! | task             | cadence             | work                                              |
//! |------------------|---------------------|---------------------------------------------------|
//! | `ban_expiry`     | `banSweepSecs`      | auto-release expired bans, sweep and reload cache |
//! | `bucket_evict`   | `bucketSweepSecs`   | evict recovered idle token buckets                |
//! | `window_archive` | `archiveSweepSecs`  | archive windows older than `archiveAfterDays`     |
//! | `history_purge`  | `archiveSweepSecs`  | purge old login attempts and released bans        |
//!
//! A failing task is logged and stays due, so it is retried on the next tick.
//! Runs never overlap; a concurrent [`CleanupScheduler::run_once`] returns `None`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ban::BanManager;
use crate::clock::{millis, Clock};
use crate::config::SharedConfig;
use crate::error::StoreError;
use crate::limiter::TokenBucketLimiter;

/// Maintenance sub-tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupTask {
    BanExpiry,
    BucketEvict,
    WindowArchive,
    HistoryPurge,
}

impl CleanupTask {
    /// Every task, in run order.
    pub const ALL: [CleanupTask; 4] =
        [Self::BanExpiry, Self::BucketEvict, Self::WindowArchive, Self::HistoryPurge];

    pub fn name(self) -> &'static str {
        match self {
            Self::BanExpiry => "ban_expiry",
            Self::BucketEvict => "bucket_evict",
            Self::WindowArchive => "window_archive",
            Self::HistoryPurge => "history_purge",
        }
    }
}

/// What happened to one task during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Cadence has not elapsed yet.
    NotDue,
    /// Ran; `affected` rows or entries were released, evicted, archived or purged.
    Completed { affected: u64 },
    /// Ran and failed; the task stays due.
    Failed(String),
}

/// Per-task outcomes of one run, in run order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub outcomes: Vec<(CleanupTask, TaskOutcome)>,
}

impl CleanupReport {
    pub fn outcome(&self, task: CleanupTask) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|(t, _)| *t == task).map(|(_, o)| o)
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|(_, o)| matches!(o, TaskOutcome::Failed(_)))
    }
}

struct Inner {
    limiter: Arc<TokenBucketLimiter>,
    bans: Arc<BanManager>,
    clock: Arc<dyn Clock>,
    config: SharedConfig,
    last_success: Mutex<HashMap<CleanupTask, u64>>,
    run_guard: tokio::sync::Mutex<()>,
    runs: AtomicU64,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Background maintenance loop. Clones share the same scheduler.
#[derive(Clone)]
pub struct CleanupScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScheduler").field("runs", &self.runs()).finish()
    }
}

impl CleanupScheduler {
    pub fn new(
        limiter: Arc<TokenBucketLimiter>,
        bans: Arc<BanManager>,
        clock: Arc<dyn Clock>,
        config: SharedConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                limiter,
                bans,
                clock,
                config,
                last_success: Mutex::new(HashMap::new()),
                run_guard: tokio::sync::Mutex::new(()),
                runs: AtomicU64::new(0),
                shutdown,
                handle: Mutex::new(None),
            }),
        }
    }

    /// Spawn the tick loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut handle = self.inner.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        let scheduler = self.clone();
        let mut stop = self.inner.shutdown.subscribe();
        let period = self.inner.config.get().cleanup_interval();

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(target: "portcullis::cleanup", ?period, "cleanup scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_once().await;
                    }
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }
            }
            tracing::debug!(target: "portcullis::cleanup", "cleanup scheduler stopped");
        }));
    }

    /// Stop the loop and wait for an in-flight run to finish.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let handle = self.inner.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(target: "portcullis::cleanup", error = %err, "cleanup loop panicked");
            }
        }
    }

    /// Completed runs so far.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Run every due task. `None` if a run is already in progress.
    pub async fn run_once(&self) -> Option<CleanupReport> {
        self.run(false).await
    }

    /// Run every task regardless of cadence. `None` if a run is already in progress.
    pub async fn run_all(&self) -> Option<CleanupReport> {
        self.run(true).await
    }

    async fn run(&self, force: bool) -> Option<CleanupReport> {
        let Ok(_guard) = self.inner.run_guard.try_lock() else {
            tracing::debug!(target: "portcullis::cleanup", "cleanup already running, skipping");
            return None;
        };

        let mut report = CleanupReport::default();
        for task in CleanupTask::ALL {
            let now = self.inner.clock.now_millis();
            if !force && !self.is_due(task, now) {
                report.outcomes.push((task, TaskOutcome::NotDue));
                continue;
            }
            let outcome = match self.run_task(task, now).await {
                Ok(affected) => {
                    self.last_success().insert(task, now);
                    if affected > 0 {
                        tracing::info!(target: "portcullis::cleanup", task = task.name(), affected, "cleanup task done");
                    }
                    TaskOutcome::Completed { affected }
                }
                Err(err) => {
                    tracing::error!(target: "portcullis::cleanup", task = task.name(), error = %err, "cleanup task failed");
                    TaskOutcome::Failed(err.to_string())
                }
            };
            report.outcomes.push((task, outcome));
        }
        self.inner.runs.fetch_add(1, Ordering::Relaxed);
        Some(report)
    }

    fn last_success(&self) -> std::sync::MutexGuard<'_, HashMap<CleanupTask, u64>> {
        self.inner.last_success.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cadence(&self, task: CleanupTask) -> Duration {
        let config = self.inner.config.get();
        let secs = match task {
            CleanupTask::BanExpiry => config.ban_sweep_secs,
            CleanupTask::BucketEvict => config.bucket_sweep_secs,
            CleanupTask::WindowArchive | CleanupTask::HistoryPurge => config.archive_sweep_secs,
        };
        Duration::from_secs(secs)
    }

    fn is_due(&self, task: CleanupTask, now: u64) -> bool {
        let last = self.last_success().get(&task).copied();
        match last {
            None => true,
            Some(last) => now.saturating_sub(last) >= millis(self.cadence(task)),
        }
    }

    async fn run_task(&self, task: CleanupTask, now: u64) -> Result<u64, StoreError> {
        let inner = &self.inner;
        let config = inner.config.get();
        let store = inner.bans.store();
        match task {
            CleanupTask::BanExpiry => {
                inner.bans.expire_cached();
                let released = store.release_expired_bans(now).await?;
                for ban in &released {
                    inner.bans.audit_auto_release(ban);
                }
                inner.bans.restore_from_store().await?;
                // failure rows this old are archived and never counted again
                inner.bans.prune_floors(now.saturating_sub(millis(config.archive_after())));
                Ok(released.len() as u64)
            }
            CleanupTask::BucketEvict => Ok(inner.limiter.evict_idle(config.bucket_idle()) as u64),
            CleanupTask::WindowArchive => {
                let cutoff = now.saturating_sub(millis(config.archive_after()));
                store.archive_windows_before(cutoff).await
            }
            CleanupTask::HistoryPurge => {
                let attempts = now.saturating_sub(millis(config.login_attempt_retention()));
                let released = now.saturating_sub(millis(config.released_ban_retention()));
                let purged_attempts = store.purge_login_attempts_before(attempts).await?;
                let purged_bans = store.purge_released_bans_before(released).await?;
                Ok(purged_attempts + purged_bans)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAuditSink, NonBlockingAudit};
    use crate::clock::ManualClock;
    use crate::config::GateConfig;
    use crate::dispatch::WriteDispatcher;
    use crate::model::{LoginAttemptRecord, RequestOutcome};
    use crate::retry::{InstantSleeper, WriteRetry};
    use crate::store::{DurableStore, InMemoryStore};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Fixture {
        scheduler: CleanupScheduler,
        limiter: Arc<TokenBucketLimiter>,
        bans: Arc<BanManager>,
        store: InMemoryStore,
        clock: ManualClock,
        sink: MemoryAuditSink,
        writes: WriteDispatcher,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let clock = ManualClock::new(1_700_000_000_000);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let sink = MemoryAuditSink::new();
        let retry = WriteRetry::new(1, Duration::from_millis(1)).with_sleeper(InstantSleeper);
        let writes = WriteDispatcher::spawn(Arc::new(store.clone()), retry, 64);
        let audit = NonBlockingAudit::with_capacity(Arc::new(sink.clone()), 64);
        let bans = Arc::new(BanManager::new(
            Arc::new(store.clone()),
            writes.clone(),
            audit,
            shared_clock.clone(),
        ));
        let limiter = Arc::new(TokenBucketLimiter::with_clock(1.0, 2, shared_clock.clone()));
        let config = SharedConfig::new(GateConfig::default()).unwrap();
        let scheduler = CleanupScheduler::new(limiter.clone(), bans.clone(), shared_clock, config);
        Fixture { scheduler, limiter, bans, store, clock, sink, writes }
    }

    #[tokio::test]
    async fn expired_bans_are_auto_released_and_audited() {
        let f = fixture();
        f.bans.ban("10.0.0.1", "too_many_failed_logins", Duration::from_secs(300), 5, "system").unwrap();
        f.writes.flush().await;

        f.clock.advance(Duration::from_secs(301));
        let report = f.scheduler.run_once().await.unwrap();
        assert_eq!(report.outcome(CleanupTask::BanExpiry), Some(&TaskOutcome::Completed { affected: 1 }));

        let stored = f.store.bans();
        assert!(stored[0].auto_released);
        assert_eq!(f.bans.cached_len(), 0);

        f.bans.audit().flush().await;
        assert_eq!(f.sink.actions("ip_auto_released").await.len(), 1);
    }

    #[tokio::test]
    async fn tasks_follow_their_own_cadence() {
        let f = fixture();
        let first = f.scheduler.run_once().await.unwrap();
        assert!(first.outcomes.iter().all(|(_, o)| matches!(o, TaskOutcome::Completed { .. })));

        f.clock.advance(Duration::from_secs(30));
        let second = f.scheduler.run_once().await.unwrap();
        assert!(matches!(second.outcome(CleanupTask::BanExpiry), Some(TaskOutcome::Completed { .. })));
        assert_eq!(second.outcome(CleanupTask::BucketEvict), Some(&TaskOutcome::NotDue));
        assert_eq!(second.outcome(CleanupTask::WindowArchive), Some(&TaskOutcome::NotDue));

        f.clock.advance(Duration::from_secs(270));
        let third = f.scheduler.run_once().await.unwrap();
        assert!(matches!(third.outcome(CleanupTask::BucketEvict), Some(TaskOutcome::Completed { .. })));
        assert_eq!(third.outcome(CleanupTask::HistoryPurge), Some(&TaskOutcome::NotDue));
    }

    #[tokio::test]
    async fn failed_task_stays_due_and_others_still_run() {
        let f = fixture();
        assert!(f.limiter.allow("idle"));
        f.clock.advance(Duration::from_secs(600));
        f.store.set_available(false);

        let report = f.scheduler.run_once().await.unwrap();
        assert!(report.has_failures());
        assert!(matches!(report.outcome(CleanupTask::BanExpiry), Some(TaskOutcome::Failed(_))));
        assert_eq!(report.outcome(CleanupTask::BucketEvict), Some(&TaskOutcome::Completed { affected: 1 }));
        assert_eq!(f.limiter.tracked_clients(), 0);

        f.store.set_available(true);
        let retry = f.scheduler.run_once().await.unwrap();
        assert!(matches!(retry.outcome(CleanupTask::BanExpiry), Some(TaskOutcome::Completed { .. })));
        assert!(matches!(retry.outcome(CleanupTask::WindowArchive), Some(TaskOutcome::Completed { .. })));
        assert_eq!(retry.outcome(CleanupTask::BucketEvict), Some(&TaskOutcome::NotDue));
    }

    #[tokio::test]
    async fn archives_and_purges_by_age() {
        let f = fixture();
        let now = f.clock.now_millis();
        let old = now - 8 * millis(DAY);
        f.store.increment_window("c", "/login", old, RequestOutcome::Failed).await.unwrap();
        f.store.increment_window("c", "/login", now, RequestOutcome::Failed).await.unwrap();
        for ts in [now - 91 * millis(DAY), now - millis(DAY)] {
            f.store
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

        let report = f.scheduler.run_all().await.unwrap();
        assert_eq!(report.outcome(CleanupTask::WindowArchive), Some(&TaskOutcome::Completed { affected: 1 }));
        assert_eq!(report.outcome(CleanupTask::HistoryPurge), Some(&TaskOutcome::Completed { affected: 1 }));
        assert_eq!(f.store.windows().len(), 1);
        assert_eq!(f.store.archived_windows().len(), 1);
        assert_eq!(f.store.login_attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_runs_are_rejected() {
        let f = fixture();
        f.store.set_latency(Duration::from_secs(1));
        let busy = f.scheduler.clone();
        let first = tokio::spawn(async move { busy.run_all().await });
        tokio::task::yield_now().await;

        assert!(f.scheduler.run_once().await.is_none());
        assert!(first.await.unwrap().is_some());
        assert!(f.scheduler.run_once().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_until_shutdown() {
        let f = fixture();
        f.scheduler.start();
        tokio::time::sleep(Duration::from_secs(95)).await;
        f.scheduler.shutdown().await;

        let runs = f.scheduler.runs();
        assert!(runs >= 3, "expected ticks at 0s, 30s, 60s, 90s; got {runs}");
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.scheduler.runs(), runs, "no runs after shutdown");
    }
}
