//! Ban cache with durable backing.
//!
//! Lookups read only the in-memory cache. Bans and releases update the cache
//! first and then queue the durable write, so a slow store never delays the
//! decision that produced them. `restore_from_store` loads what other
//! instances (or a previous run) persisted.
//!
//! Invariants:
//! - At most one cache entry per address; a second ban extends the first.
//! - Expired entries read as not banned even before they are swept.
//! - `banned_until > banned_at` for every ban created here.
//! - Failures recorded before a ban ended (by expiry or release) never count
//!   toward the next escalation; see [`BanManager::escalation_floor`].
//! - A manual release is not undone by reloading a store row whose release
//!   write has not landed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;

use crate::audit::{AuditEvent, NonBlockingAudit};
use crate::clock::{millis, Clock};
use crate::dispatch::{WriteDispatcher, WriteOp};
use crate::error::{GateError, StoreError};
use crate::gate::{RATE_LIMIT_EXCEEDED, REASON_OK};
use crate::model::{validate_client_id, Ban};
use crate::store::DurableStore;

const ENTITY_TYPE: &str = "ip_ban";

/// Result of a ban lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BanStatus {
    pub banned: bool,
    /// Zero when not banned.
    pub remaining: Duration,
    /// Reason of the active ban.
    pub reason: Option<String>,
}

/// A manual release kept until the released ban would have expired.
#[derive(Debug, Clone, Copy)]
struct ReleaseMark {
    released_at: u64,
    banned_until: u64,
}

#[derive(Debug, Default)]
struct Registry {
    active: HashMap<String, Ban>,
    floors: HashMap<String, u64>,
    released: HashMap<String, ReleaseMark>,
}

impl Registry {
    fn raise_floor(&mut self, client_id: &str, at: u64) {
        let floor = self.floors.entry(client_id.to_string()).or_insert(at);
        *floor = (*floor).max(at);
    }
}

/// Tracks banned client identifiers.
#[derive(Debug)]
pub struct BanManager {
    registry: Mutex<Registry>,
    store: Arc<dyn DurableStore>,
    writes: WriteDispatcher,
    audit: NonBlockingAudit,
    clock: Arc<dyn Clock>,
}

impl BanManager {
    pub fn new(
        store: Arc<dyn DurableStore>,
        writes: WriteDispatcher,
        audit: NonBlockingAudit,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { registry: Mutex::new(Registry::default()), store, writes, audit, clock }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cache-only lookup.
    pub fn is_banned(&self, client_id: &str) -> BanStatus {
        let now = self.clock.now_millis();
        match self.lock().active.get(client_id) {
            Some(ban) if ban.is_active(now) => BanStatus {
                banned: true,
                remaining: ban.remaining(now),
                reason: Some(ban.reason.clone()),
            },
            _ => BanStatus::default(),
        }
    }

    /// Ban `client_id` for `duration`, or extend its active ban.
    ///
    /// An extension keeps the original `banned_at`, moves `banned_until` to the
    /// later deadline and keeps the larger attempt count. `ok` and
    /// `rate_limit_exceeded` are reserved and rejected as reasons.
    pub fn ban(
        &self,
        client_id: &str,
        reason: &str,
        duration: Duration,
        failed_attempts: u32,
        banned_by: &str,
    ) -> Result<Ban, GateError> {
        validate_client_id(client_id)?;
        if duration.is_zero() {
            return Err(GateError::InvalidBanDuration(duration));
        }
        if reason.is_empty() || reason == RATE_LIMIT_EXCEEDED || reason == REASON_OK {
            return Err(GateError::InvalidBanReason { reason: reason.to_string() });
        }
        let now = self.clock.now_millis();
        let until = now.saturating_add(millis(duration)).max(now + 1);

        let (previous, ban) = {
            let mut registry = self.lock();
            let previous = registry.active.get(client_id).filter(|b| b.is_active(now)).cloned();
            let ban = match &previous {
                Some(active) => {
                    let mut extended = active.clone();
                    if until > extended.banned_until {
                        extended.banned_until = until;
                        extended.reason = reason.to_string();
                    }
                    extended.failed_attempts = extended.failed_attempts.max(failed_attempts);
                    extended
                }
                None => Ban {
                    ip_address: client_id.to_string(),
                    banned_at: now,
                    banned_until: until,
                    reason: reason.to_string(),
                    failed_attempts,
                    banned_by: banned_by.to_string(),
                    released_at: None,
                    released_by: None,
                    auto_released: false,
                },
            };
            registry.active.insert(client_id.to_string(), ban.clone());
            registry.raise_floor(client_id, ban.banned_until);
            registry.released.remove(client_id);
            (previous, ban)
        };

        self.writes.submit(WriteOp::UpsertBan(ban.clone()));
        tracing::info!(
            target: "portcullis::ban",
            client = client_id,
            reason,
            until = ban.banned_until,
            failed_attempts = ban.failed_attempts,
            extended = previous.is_some(),
            "client banned"
        );
        self.audit.emit(AuditEvent {
            actor_id: banned_by.to_string(),
            action: "ip_banned".into(),
            entity_type: ENTITY_TYPE.into(),
            entity_id: client_id.to_string(),
            old_values: previous.as_ref().map(ban_values),
            new_values: Some(ban_values(&ban)),
            client_context: None,
            at_millis: now,
        });
        Ok(ban)
    }

    /// Release the active ban on `client_id`. `Ok(None)` if there is none.
    pub fn unban(&self, client_id: &str, released_by: &str) -> Result<Option<Ban>, GateError> {
        self.unban_with_note(client_id, released_by, None)
    }

    /// [`unban`](Self::unban) with a note recorded in the audit trail.
    pub fn unban_with_note(
        &self,
        client_id: &str,
        released_by: &str,
        note: Option<&str>,
    ) -> Result<Option<Ban>, GateError> {
        validate_client_id(client_id)?;
        let now = self.clock.now_millis();
        let mut ban = {
            let mut registry = self.lock();
            let Some(ban) = registry.active.remove(client_id).filter(|b| b.is_active(now)) else {
                return Ok(None);
            };
            // the release starts a clean slate, even before the ban's deadline
            registry.floors.insert(client_id.to_string(), now);
            registry
                .released
                .insert(client_id.to_string(), ReleaseMark { released_at: now, banned_until: ban.banned_until });
            ban
        };
        let before = ban_values(&ban);
        ban.release(now, released_by, false);

        self.writes.submit(WriteOp::ReleaseBan {
            ip_address: client_id.to_string(),
            at: now,
            released_by: released_by.to_string(),
            automatic: false,
        });
        tracing::info!(target: "portcullis::ban", client = client_id, released_by, "client unbanned");
        self.audit.emit(AuditEvent {
            actor_id: released_by.to_string(),
            action: "ip_unbanned".into(),
            entity_type: ENTITY_TYPE.into(),
            entity_id: client_id.to_string(),
            old_values: Some(before),
            new_values: Some(ban_values(&ban)),
            client_context: note.map(str::to_string),
            at_millis: now,
        });
        Ok(Some(ban))
    }

    /// Active bans, sorted by address.
    pub fn list_active(&self) -> Vec<Ban> {
        let now = self.clock.now_millis();
        let mut bans: Vec<Ban> =
            self.lock().active.values().filter(|b| b.is_active(now)).cloned().collect();
        bans.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));
        bans
    }

    /// Instant from which failures of `client_id` count toward escalation:
    /// the end of its latest ban, or the time it was released.
    pub fn escalation_floor(&self, client_id: &str) -> Option<u64> {
        self.lock().floors.get(client_id).copied()
    }

    /// Merge the store's active bans into the cache. Returns how many entries
    /// were added or extended.
    ///
    /// Merge only: a cached ban missing from the store may simply not have
    /// been written yet, so it is kept. A store row for a ban released here
    /// is skipped; its release write may still be queued or may have been
    /// dropped. Bans issued after that release are loaded.
    pub async fn restore_from_store(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let persisted = self.store.active_bans(now).await?;
        let mut registry = self.lock();
        registry.released.retain(|_, mark| mark.banned_until > now);
        let mut merged = 0;
        for ban in persisted {
            if let Some(mark) = registry.released.get(&ban.ip_address) {
                if ban.banned_at <= mark.released_at {
                    continue;
                }
            }
            let until = ban.banned_until;
            let ip = ban.ip_address.clone();
            match registry.active.get_mut(&ip) {
                Some(cached) if cached.is_active(now) => {
                    if until > cached.banned_until {
                        cached.banned_until = until;
                        merged += 1;
                    }
                }
                _ => {
                    registry.active.insert(ip.clone(), ban);
                    merged += 1;
                }
            }
            registry.raise_floor(&ip, until);
        }
        Ok(merged)
    }

    /// Drop cache entries whose ban has expired. Returns the dropped entries.
    pub fn expire_cached(&self) -> Vec<Ban> {
        let now = self.clock.now_millis();
        let mut registry = self.lock();
        registry.released.retain(|_, mark| mark.banned_until > now);
        let expired: Vec<String> =
            registry.active.iter().filter(|(_, b)| !b.is_active(now)).map(|(k, _)| k.clone()).collect();
        expired.iter().filter_map(|k| registry.active.remove(k)).collect()
    }

    /// Forget escalation floors older than `before`. Returns how many were dropped.
    pub fn prune_floors(&self, before: u64) -> usize {
        let mut registry = self.lock();
        let start = registry.floors.len();
        registry.floors.retain(|_, floor| *floor >= before);
        start - registry.floors.len()
    }

    /// Report an automatic release performed by the store.
    pub(crate) fn audit_auto_release(&self, ban: &Ban) {
        tracing::info!(target: "portcullis::ban", client = %ban.ip_address, "ban expired");
        self.audit.emit(AuditEvent {
            actor_id: ban.released_by.clone().unwrap_or_else(|| "system".into()),
            action: "ip_auto_released".into(),
            entity_type: ENTITY_TYPE.into(),
            entity_id: ban.ip_address.clone(),
            old_values: None,
            new_values: Some(ban_values(ban)),
            client_context: None,
            at_millis: ban.released_at.unwrap_or_else(|| self.clock.now_millis()),
        });
    }

    pub(crate) fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn audit(&self) -> &NonBlockingAudit {
        &self.audit
    }

    pub fn cached_len(&self) -> usize {
        self.lock().active.len()
    }
}

fn ban_values(ban: &Ban) -> serde_json::Value {
    json!({
        "reason": ban.reason,
        "failedAttempts": ban.failed_attempts,
        "bannedAt": ban.banned_at,
        "bannedUntil": ban.banned_until,
        "bannedBy": ban.banned_by,
        "releasedAt": ban.released_at,
        "releasedBy": ban.released_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::retry::{InstantSleeper, WriteRetry};
    use crate::store::InMemoryStore;

    struct Fixture {
        bans: BanManager,
        store: InMemoryStore,
        clock: ManualClock,
        sink: MemoryAuditSink,
        writes: WriteDispatcher,
    }

    impl Fixture {
        fn new() -> Self {
            let store = InMemoryStore::new();
            let clock = ManualClock::new(1_700_000_000_000);
            let sink = MemoryAuditSink::new();
            let retry = WriteRetry::new(2, Duration::from_millis(1)).with_sleeper(InstantSleeper);
            let writes = WriteDispatcher::spawn(Arc::new(store.clone()), retry, 64);
            let audit = NonBlockingAudit::with_capacity(Arc::new(sink.clone()), 64);
            let bans = BanManager::new(
                Arc::new(store.clone()),
                writes.clone(),
                audit,
                Arc::new(clock.clone()),
            );
            Self { bans, store, clock, sink, writes }
        }

        async fn settle(&self) {
            self.writes.flush().await;
            self.bans.audit().flush().await;
        }
    }

    const FIVE_MIN: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn ban_lifecycle_follows_the_clock() {
        let f = Fixture::new();
        f.bans.ban("10.0.0.1", "too_many_failed_logins", FIVE_MIN, 5, "system").unwrap();

        let status = f.bans.is_banned("10.0.0.1");
        assert!(status.banned);
        assert_eq!(status.remaining, FIVE_MIN);
        assert_eq!(status.reason.as_deref(), Some("too_many_failed_logins"));

        f.clock.advance(Duration::from_secs(60));
        let status = f.bans.is_banned("10.0.0.1");
        assert!(status.banned);
        assert!(status.remaining < FIVE_MIN);

        f.clock.advance(Duration::from_secs(241));
        assert!(!f.bans.is_banned("10.0.0.1").banned);
        assert!(f.bans.list_active().is_empty());
    }

    #[tokio::test]
    async fn second_ban_extends_instead_of_duplicating() {
        let f = Fixture::new();
        let first = f.bans.ban("10.0.0.1", "a", FIVE_MIN, 5, "system").unwrap();
        f.clock.advance(Duration::from_secs(60));
        let second = f.bans.ban("10.0.0.1", "b", FIVE_MIN, 7, "system").unwrap();

        assert_eq!(second.banned_at, first.banned_at);
        assert_eq!(second.banned_until, first.banned_until + 60_000);
        assert_eq!(second.failed_attempts, 7);
        assert_eq!(f.bans.list_active().len(), 1);

        // a shorter ban never shortens the active one
        let third = f.bans.ban("10.0.0.1", "c", Duration::from_secs(1), 1, "system").unwrap();
        assert_eq!(third.banned_until, second.banned_until);
        assert_eq!(third.reason, "b");

        f.settle().await;
        assert_eq!(f.store.bans().len(), 1);
        assert_eq!(f.store.bans()[0].banned_until, second.banned_until);
    }

    #[tokio::test]
    async fn ban_rejects_bad_input() {
        let f = Fixture::new();
        assert_eq!(
            f.bans.ban("10.0.0.1", "x", Duration::ZERO, 1, "system"),
            Err(GateError::InvalidBanDuration(Duration::ZERO))
        );
        assert!(matches!(
            f.bans.ban("", "x", FIVE_MIN, 1, "system"),
            Err(GateError::InvalidClientId { .. })
        ));
        for reserved in ["rate_limit_exceeded", "ok", ""] {
            assert_eq!(
                f.bans.ban("10.0.0.1", reserved, FIVE_MIN, 1, "admin"),
                Err(GateError::InvalidBanReason { reason: reserved.to_string() })
            );
        }
        assert!(f.bans.list_active().is_empty());
    }

    #[tokio::test]
    async fn unban_is_idempotent() {
        let f = Fixture::new();
        f.bans.ban("10.0.0.1", "x", FIVE_MIN, 5, "system").unwrap();

        let released = f.bans.unban("10.0.0.1", "admin-7").unwrap().expect("was banned");
        assert_eq!(released.released_by.as_deref(), Some("admin-7"));
        assert!(!released.auto_released);
        assert!(!f.bans.is_banned("10.0.0.1").banned);

        assert_eq!(f.bans.unban("10.0.0.1", "admin-7").unwrap(), None);
        assert_eq!(f.bans.unban("192.0.2.1", "admin-7").unwrap(), None);

        f.settle().await;
        assert_eq!(f.store.active_bans(f.clock.now_millis()).await.unwrap().len(), 0);
        assert_eq!(f.store.bans()[0].released_by.as_deref(), Some("admin-7"));
    }

    #[tokio::test]
    async fn ban_and_unban_are_audited() {
        let f = Fixture::new();
        f.bans.ban("10.0.0.1", "too_many_failed_logins", FIVE_MIN, 5, "system").unwrap();
        f.bans.unban_with_note("10.0.0.1", "admin-7", Some("false positive")).unwrap();
        f.settle().await;

        let events = f.sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "ip_banned");
        assert_eq!(events[0].new_values.as_ref().unwrap()["failedAttempts"], 5);
        assert!(events[0].old_values.is_none());
        assert_eq!(events[1].action, "ip_unbanned");
        assert_eq!(events[1].actor_id, "admin-7");
        assert_eq!(events[1].client_context.as_deref(), Some("false positive"));
        assert_eq!(events[1].old_values.as_ref().unwrap()["reason"], "too_many_failed_logins");
    }

    #[tokio::test]
    async fn restore_loads_persisted_bans() {
        let f = Fixture::new();
        let now = f.clock.now_millis();
        f.store
            .upsert_ban(&Ban {
                ip_address: "198.51.100.4".into(),
                banned_at: now - 1_000,
                banned_until: now + 60_000,
                reason: "manual".into(),
                failed_attempts: 0,
                banned_by: "admin".into(),
                released_at: None,
                released_by: None,
                auto_released: false,
            })
            .await
            .unwrap();

        assert!(!f.bans.is_banned("198.51.100.4").banned);
        assert_eq!(f.bans.restore_from_store().await.unwrap(), 1);
        assert!(f.bans.is_banned("198.51.100.4").banned);
        // nothing new the second time
        assert_eq!(f.bans.restore_from_store().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expire_cached_drops_only_expired_entries() {
        let f = Fixture::new();
        f.bans.ban("short", "x", Duration::from_secs(10), 1, "system").unwrap();
        f.bans.ban("long", "x", FIVE_MIN, 1, "system").unwrap();
        f.clock.advance(Duration::from_secs(10));

        let expired = f.bans.expire_cached();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].ip_address, "short");
        assert_eq!(f.bans.cached_len(), 1);
    }

    #[tokio::test]
    async fn list_active_is_sorted() {
        let f = Fixture::new();
        for ip in ["10.0.0.3", "10.0.0.1", "10.0.0.2"] {
            f.bans.ban(ip, "x", FIVE_MIN, 1, "system").unwrap();
        }
        let ips: Vec<_> = f.bans.list_active().into_iter().map(|b| b.ip_address).collect();
        assert_eq!(ips, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    fn persisted(ip: &str, banned_at: u64, banned_until: u64) -> Ban {
        Ban {
            ip_address: ip.into(),
            banned_at,
            banned_until,
            reason: "manual".into(),
            failed_attempts: 0,
            banned_by: "admin".into(),
            released_at: None,
            released_by: None,
            auto_released: false,
        }
    }

    #[tokio::test]
    async fn restore_does_not_resurrect_a_release_whose_write_was_lost() {
        let f = Fixture::new();
        f.bans.ban("10.0.0.1", "manual", FIVE_MIN, 0, "admin").unwrap();
        f.settle().await;

        f.store.set_available(false);
        f.bans.unban("10.0.0.1", "admin").unwrap().expect("was banned");
        f.settle().await;
        f.store.set_available(true);
        // the durable row is still unreleased
        assert_eq!(f.store.active_bans(f.clock.now_millis()).await.unwrap().len(), 1);

        assert_eq!(f.bans.restore_from_store().await.unwrap(), 0);
        assert!(!f.bans.is_banned("10.0.0.1").banned);
    }

    #[tokio::test]
    async fn restore_loads_a_ban_issued_after_the_release() {
        let f = Fixture::new();
        f.bans.ban("10.0.0.1", "manual", FIVE_MIN, 0, "admin").unwrap();
        f.bans.unban("10.0.0.1", "admin").unwrap();
        f.settle().await;

        f.clock.advance(Duration::from_secs(5));
        let now = f.clock.now_millis();
        f.store.upsert_ban(&persisted("10.0.0.1", now, now + 60_000)).await.unwrap();

        assert_eq!(f.bans.restore_from_store().await.unwrap(), 1);
        assert!(f.bans.is_banned("10.0.0.1").banned);
    }

    #[tokio::test]
    async fn escalation_floor_tracks_ban_end_and_release() {
        let f = Fixture::new();
        assert_eq!(f.bans.escalation_floor("10.0.0.1"), None);

        let ban = f.bans.ban("10.0.0.1", "x", FIVE_MIN, 5, "system").unwrap();
        assert_eq!(f.bans.escalation_floor("10.0.0.1"), Some(ban.banned_until));

        f.clock.advance(Duration::from_secs(30));
        f.bans.unban("10.0.0.1", "admin").unwrap();
        assert_eq!(f.bans.escalation_floor("10.0.0.1"), Some(f.clock.now_millis()));

        let now = f.clock.now_millis();
        f.store.upsert_ban(&persisted("10.0.0.2", now - 1, now + 60_000)).await.unwrap();
        f.bans.restore_from_store().await.unwrap();
        assert_eq!(f.bans.escalation_floor("10.0.0.2"), Some(now + 60_000));

        assert_eq!(f.bans.prune_floors(now + 1), 1);
        assert_eq!(f.bans.escalation_floor("10.0.0.1"), None);
        assert!(f.bans.escalation_floor("10.0.0.2").is_some());
    }
}
