//! SQLite-backed revisit throttle store

use crate::proxy::models::ValidationRecord;
use crate::proxy::throttle::ThrottleStore;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Throttle records persisted in a SQLite file
#[derive(Debug, Clone)]
pub struct SqliteThrottle {
    pool: SqlitePool,
}

impl SqliteThrottle {
    /// Open (creating when missing) the database at `path`
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!(path = %path.display(), "opened throttle database");
        Ok(store)
    }

    /// Open a private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection, otherwise each connection sees its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS validation_records (
                host_key TEXT PRIMARY KEY,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_checked_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of stored records
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM validation_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ThrottleStore for SqliteThrottle {
    async fn get(&self, host_key: &str) -> Result<Option<ValidationRecord>> {
        let row: Option<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT host_key, failure_count, last_checked_at FROM validation_records WHERE host_key = ?1",
        )
        .bind(host_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(host_key, failure_count, last_checked_at)| {
            ValidationRecord::new(host_key, failure_count.max(0) as u32, last_checked_at)
        }))
    }

    async fn upsert_failure(&self, host_key: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO validation_records (host_key, failure_count, last_checked_at)
            VALUES (?1, 1, ?2)
            ON CONFLICT(host_key) DO UPDATE SET
                failure_count = failure_count + 1,
                last_checked_at = excluded.last_checked_at
            "#,
        )
        .bind(host_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, host_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM validation_records WHERE host_key = ?1")
            .bind(host_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
