use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

use crate::error::{Error, Result};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
pub(crate) async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::BackendUnavailable(format!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        ))),
    }
}

/// Canonical timestamp format for TEXT columns: RFC 3339 UTC with fixed
/// nanosecond precision, so lexicographic ordering equals time ordering and
/// parse(db_ts(t)) == t.
pub fn db_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| Error::Internal(format!("create data dir: {e}")))?;
        let db_path = data_dir.join("tracewatch.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .map_err(|e| Error::Internal(format!("sqlite options: {e}")))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    ///
    /// Pinned to a single pooled connection: every `:memory:` connection is
    /// its own database, so a wider pool would scatter tables.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Internal(format!("sqlite options: {e}")))?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    /// Used to create MonitorStore sharing the same SQLite connection.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    /// `SELECT 1` liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ─── Settings ────────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn settings_round_trip() {
        let storage = Storage::in_memory().await.unwrap();
        assert_eq!(storage.get_setting("k").await.unwrap(), None);
        storage.set_setting("k", "v1").await.unwrap();
        storage.set_setting("k", "v2").await.unwrap();
        assert_eq!(storage.get_setting("k").await.unwrap(), Some("v2".into()));
    }

    #[test]
    fn db_ts_orders_lexicographically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(250);
        let c = a + chrono::Duration::seconds(1);
        assert!(db_ts(a) < db_ts(b));
        assert!(db_ts(b) < db_ts(c));
    }
}
