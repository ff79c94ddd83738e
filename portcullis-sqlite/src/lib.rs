//! SQLite durable store for `portcullis`.
//!
//! Window increments are a single `INSERT ... ON CONFLICT DO UPDATE`, so
//! concurrent writers never lose counts. A partial unique index keeps at most
//! one unreleased ban per address, and archival moves rows inside one
//! transaction.
//!
//! Timestamps are stored as integer epoch milliseconds.

use std::path::Path;

use async_trait::async_trait;
use portcullis::{Ban, DurableStore, LoginAttemptRecord, RequestOutcome, StoreError, WindowCounts};
use sqlx::sqlite::{self, SqlitePool, SqliteRow};
use sqlx::Row;

mod schema;

// SQLITE_BUSY / SQLITE_LOCKED
const TRANSIENT_CODES: [&str; 2] = ["5", "6"];

fn map_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::Database(ref db)
            if db.code().is_some_and(|c| TRANSIENT_CODES.contains(&c.as_ref())) =>
        {
            StoreError::Unavailable(err.to_string())
        }
        other => {
            tracing::debug!(target: "portcullis::store", error = ?other, "sqlite error");
            StoreError::Backend(other.to_string())
        }
    }
}

// SQLite integers are signed; saturate instead of wrapping.
fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

const BAN_COLUMNS: &str = "ip_address, banned_at, banned_until, reason, failed_attempts, banned_by, \
                           released_at, released_by, auto_released";

fn read_ban(row: &SqliteRow) -> Result<Ban, sqlx::Error> {
    Ok(Ban {
        ip_address: row.try_get("ip_address")?,
        banned_at: from_db(row.try_get("banned_at")?),
        banned_until: from_db(row.try_get("banned_until")?),
        reason: row.try_get("reason")?,
        failed_attempts: u32::try_from(row.try_get::<i64, _>("failed_attempts")?).unwrap_or(u32::MAX),
        banned_by: row.try_get("banned_by")?,
        released_at: row.try_get::<Option<i64>, _>("released_at")?.map(from_db),
        released_by: row.try_get("released_by")?,
        auto_released: row.try_get("auto_released")?,
    })
}

fn read_bans(rows: Vec<SqliteRow>) -> Result<Vec<Ban>, StoreError> {
    rows.iter().map(read_ban).collect::<Result<_, _>>().map_err(map_err)
}

/// [`DurableStore`] on a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `path` in WAL mode.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let opts = sqlite::SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let db = sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(map_err)?;
        Self::from_pool(db).await
    }

    /// Private in-memory database; lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = sqlite::SqliteConnectOptions::new().in_memory(true);
        // every connection would get its own database, so keep exactly one alive
        let db = sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(map_err)?;
        Self::from_pool(db).await
    }

    /// Use an existing pool; creates the schema if needed.
    pub async fn from_pool(db: SqlitePool) -> Result<Self, StoreError> {
        schema::init_db(&db).await.map_err(map_err)?;
        Ok(Self { db })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Every ban record, released ones included, oldest first.
    pub async fn all_bans(&self) -> Result<Vec<Ban>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {BAN_COLUMNS} FROM ip_bans ORDER BY ban_id"))
            .fetch_all(&self.db)
            .await
            .map_err(map_err)?;
        read_bans(rows)
    }

    pub async fn archived_window_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM rate_windows_archive")
            .fetch_one(&self.db)
            .await
            .map_err(map_err)?;
        Ok(from_db(count))
    }

    pub async fn login_attempt_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM login_attempts")
            .fetch_one(&self.db)
            .await
            .map_err(map_err)?;
        Ok(from_db(count))
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn increment_window(
        &self,
        client_id: &str,
        endpoint: &str,
        window_start: u64,
        outcome: RequestOutcome,
    ) -> Result<(), StoreError> {
        let failed = i64::from(outcome == RequestOutcome::Failed);
        let throttled = i64::from(outcome == RequestOutcome::Throttled);
        sqlx::query(
            "INSERT INTO rate_windows
                (client_id, endpoint, window_start, request_count, failure_count, throttled_count)
            VALUES (?1, ?2, ?3, 1, ?4, ?5)
            ON CONFLICT(client_id, endpoint, window_start) DO UPDATE SET
                request_count = request_count + 1,
                failure_count = failure_count + excluded.failure_count,
                throttled_count = throttled_count + excluded.throttled_count",
        )
        .bind(client_id)
        .bind(endpoint)
        .bind(to_db(window_start))
        .bind(failed)
        .bind(throttled)
        .execute(&self.db)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn count_window(
        &self,
        client_id: &str,
        endpoint: &str,
        since: u64,
    ) -> Result<WindowCounts, StoreError> {
        let row = sqlx::query(
            "SELECT coalesce(sum(request_count), 0) AS requests,
                coalesce(sum(failure_count), 0) AS failures,
                coalesce(sum(throttled_count), 0) AS throttled
            FROM rate_windows
            WHERE client_id = ?1 AND endpoint = ?2 AND window_start >= ?3",
        )
        .bind(client_id)
        .bind(endpoint)
        .bind(to_db(since))
        .fetch_one(&self.db)
        .await
        .map_err(map_err)?;

        let get = |col: &str| row.try_get::<i64, _>(col).map(from_db).map_err(map_err);
        Ok(WindowCounts { requests: get("requests")?, failures: get("failures")?, throttled: get("throttled")? })
    }

    async fn append_login_attempt(&self, record: LoginAttemptRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO login_attempts
                (username, ip_address, success, failure_reason, rate_limited, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&record.username)
        .bind(&record.ip_address)
        .bind(record.success)
        .bind(&record.failure_reason)
        .bind(record.rate_limited)
        .bind(to_db(record.timestamp))
        .execute(&self.db)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn upsert_ban(&self, ban: &Ban) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ip_bans
                (ip_address, banned_at, banned_until, reason, failed_attempts, banned_by)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(ip_address) WHERE released_at IS NULL DO UPDATE SET
                banned_at = excluded.banned_at,
                banned_until = excluded.banned_until,
                reason = excluded.reason,
                failed_attempts = excluded.failed_attempts,
                banned_by = excluded.banned_by",
        )
        .bind(&ban.ip_address)
        .bind(to_db(ban.banned_at))
        .bind(to_db(ban.banned_until))
        .bind(&ban.reason)
        .bind(i64::from(ban.failed_attempts))
        .bind(&ban.banned_by)
        .execute(&self.db)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn release_ban(
        &self,
        ip_address: &str,
        at: u64,
        released_by: &str,
        automatic: bool,
    ) -> Result<Option<Ban>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE ip_bans SET released_at = ?2, released_by = ?3, auto_released = ?4
            WHERE ip_address = ?1 AND released_at IS NULL
            RETURNING {BAN_COLUMNS}"
        ))
        .bind(ip_address)
        .bind(to_db(at))
        .bind(released_by)
        .bind(automatic)
        .fetch_optional(&self.db)
        .await
        .map_err(map_err)?;
        row.as_ref().map(read_ban).transpose().map_err(map_err)
    }

    async fn active_bans(&self, now: u64) -> Result<Vec<Ban>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BAN_COLUMNS} FROM ip_bans
            WHERE released_at IS NULL AND banned_until > ?1
            ORDER BY ip_address"
        ))
        .bind(to_db(now))
        .fetch_all(&self.db)
        .await
        .map_err(map_err)?;
        read_bans(rows)
    }

    async fn release_expired_bans(&self, now: u64) -> Result<Vec<Ban>, StoreError> {
        let rows = sqlx::query(&format!(
            "UPDATE ip_bans SET released_at = ?1, released_by = 'system', auto_released = 1
            WHERE released_at IS NULL AND banned_until <= ?1
            RETURNING {BAN_COLUMNS}"
        ))
        .bind(to_db(now))
        .fetch_all(&self.db)
        .await
        .map_err(map_err)?;
        read_bans(rows)
    }

    async fn archive_windows_before(&self, cutoff: u64) -> Result<u64, StoreError> {
        let mut tx = self.db.begin().await.map_err(map_err)?;
        sqlx::query(
            "INSERT INTO rate_windows_archive
                (client_id, endpoint, window_start, request_count, failure_count, throttled_count, archived_at)
            SELECT client_id, endpoint, window_start, request_count, failure_count, throttled_count, ?1
            FROM rate_windows WHERE window_start < ?1",
        )
        .bind(to_db(cutoff))
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        let moved = sqlx::query("DELETE FROM rate_windows WHERE window_start < ?1")
            .bind(to_db(cutoff))
            .execute(&mut *tx)
            .await
            .map_err(map_err)?
            .rows_affected();
        tx.commit().await.map_err(map_err)?;
        Ok(moved)
    }

    async fn purge_login_attempts_before(&self, cutoff: u64) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM login_attempts WHERE timestamp < ?1")
            .bind(to_db(cutoff))
            .execute(&self.db)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }

    async fn purge_released_bans_before(&self, cutoff: u64) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM ip_bans WHERE released_at IS NOT NULL AND released_at < ?1")
            .bind(to_db(cutoff))
            .execute(&self.db)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }
}
