//! Table and index creation. Idempotent; run on every connect.

use sqlx::SqlitePool;

pub(crate) async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;

    // Window counters
    //*****************
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rate_windows (
            client_id text NOT NULL,
            endpoint text NOT NULL,
            window_start integer NOT NULL,
            request_count integer NOT NULL DEFAULT 0,
            failure_count integer NOT NULL DEFAULT 0,
            throttled_count integer NOT NULL DEFAULT 0,
            PRIMARY KEY(client_id, endpoint, window_start)
        )",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rate_windows_start ON rate_windows(window_start)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rate_windows_archive (
            client_id text NOT NULL,
            endpoint text NOT NULL,
            window_start integer NOT NULL,
            request_count integer NOT NULL,
            failure_count integer NOT NULL,
            throttled_count integer NOT NULL,
            archived_at integer NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;

    // Bans
    //******
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ip_bans (
            ban_id integer PRIMARY KEY AUTOINCREMENT,
            ip_address text NOT NULL,
            banned_at integer NOT NULL,
            banned_until integer NOT NULL,
            reason text NOT NULL,
            failed_attempts integer NOT NULL DEFAULT 0,
            banned_by text NOT NULL,
            released_at integer,
            released_by text,
            auto_released integer NOT NULL DEFAULT 0,
            CHECK (banned_until > banned_at)
        )",
    )
    .execute(&mut *tx)
    .await?;
    // at most one unreleased ban per address
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_ip_bans_unreleased
            ON ip_bans(ip_address) WHERE released_at IS NULL",
    )
    .execute(&mut *tx)
    .await?;

    // Login attempts
    //****************
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS login_attempts (
            attempt_id integer PRIMARY KEY AUTOINCREMENT,
            username text NOT NULL,
            ip_address text NOT NULL,
            success integer NOT NULL,
            failure_reason text,
            rate_limited integer NOT NULL DEFAULT 0,
            timestamp integer NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_login_attempts_ts ON login_attempts(timestamp)")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_login_attempts_ip ON login_attempts(ip_address, timestamp)",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
