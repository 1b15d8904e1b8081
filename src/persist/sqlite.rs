//! SQLite storage.
//!
//! One table, WAL journal, values stored as JSON text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::persist::storage::{validate_key, KeyValueStorage, StoredValue};

/// SQLite implementation of [`KeyValueStorage`].
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open or create a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening sqlite storage");

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| SyncError::Config(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Private in-memory database, for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SyncError::Config(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("sqlite schema initialized");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[async_trait]
impl KeyValueStorage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        validate_key(key)?;

        let row: Option<(String, String, i64)> =
            sqlx::query_as("SELECT key, value, updated_at FROM local_storage WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(key, value, updated_at)| StoredValue {
            key,
            value,
            updated_at: from_millis(updated_at),
        }))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        validate_key(key)?;

        sqlx::query(
            r#"
            INSERT INTO local_storage (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let result = sqlx::query("DELETE FROM local_storage WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        // substr avoids LIKE treating '%' and '_' in the prefix as wildcards.
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM local_storage WHERE substr(key, 1, ?) = ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_set_and_get() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.set("/cb/ui", r#"{"theme":"dark"}"#.to_string()).await.unwrap();

        let stored = storage.get("/cb/ui").await.unwrap().unwrap();
        assert_eq!(stored.key, "/cb/ui");
        assert_eq!(stored.value, r#"{"theme":"dark"}"#);
    }

    #[tokio::test]
    async fn test_sqlite_overwrite_and_remove() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.set("/k", "1".to_string()).await.unwrap();
        storage.set("/k", "2".to_string()).await.unwrap();
        assert_eq!(storage.get("/k").await.unwrap().unwrap().value, "2");

        assert!(storage.remove("/k").await.unwrap());
        assert!(!storage.remove("/k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_keys_treat_prefix_literally() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        for key in ["/a_b/1", "/axb/2", "/a_b/3"] {
            storage.set(key, "null".to_string()).await.unwrap();
        }
        assert_eq!(storage.keys("/a_b/").await.unwrap(), vec!["/a_b/1", "/a_b/3"]);
    }

    #[tokio::test]
    async fn test_sqlite_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let storage = SqliteStorage::open(&path).await.unwrap();
        storage.set_json("/cb/session", &serde_json::json!({"user": null})).await.unwrap();
        storage.close().await;

        let reopened = SqliteStorage::open(&path).await.unwrap();
        let value: serde_json::Value = reopened.get_json("/cb/session").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"user": null}));
    }
}
