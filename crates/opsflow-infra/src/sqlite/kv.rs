//! SQLite context cache (`KvStore` implementation).
//!
//! Values are JSON blobs with an optional expiry. Expired entries are
//! treated as misses on read and deleted lazily.

use std::time::Duration;

use chrono::Utc;
use opsflow_core::storage::kv_store::KvStore;
use opsflow_types::error::RepositoryError;
use sqlx::Row;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, to_json};

/// SQLite-backed implementation of `KvStore`.
pub struct SqliteKvStore {
    pool: DatabasePool,
}

impl SqliteKvStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        let row = sqlx::query("SELECT value, expires_at FROM context_cache WHERE cache_key = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        let expires_at: Option<String> = row
            .try_get("expires_at")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if let Some(raw) = expires_at.as_deref() {
            if parse_datetime(raw)? <= Utc::now() {
                self.delete(key).await?;
                return Ok(None);
            }
        }

        let value: String = row
            .try_get("value")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(Some(parse_json(&value, "cache value")?))
    }

    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let expires_at = ttl
            .and_then(|d| chrono::TimeDelta::from_std(d).ok())
            .map(|d| format_datetime(&(now + d)));

        sqlx::query(
            r#"INSERT INTO context_cache (cache_key, value, created_at, expires_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(cache_key) DO UPDATE SET
                   value = excluded.value,
                   created_at = excluded.created_at,
                   expires_at = excluded.expires_at"#,
        )
        .bind(key)
        .bind(to_json(value, "cache value")?)
        .bind(format_datetime(&now))
        .bind(expires_at)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM context_cache WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }
}
