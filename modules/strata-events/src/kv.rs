//! KvStore: durable small-state store.
//!
//! Meant for out-of-band bookkeeping such as worker cursors, never for entities.
//! Entity state is derived from the log.

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read key {key}"))?;

        Ok(row.map(|r| r.0))
    }

    /// Insert or overwrite `key`.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write key {key}"))?;

        Ok(())
    }

    /// Keys matching a glob pattern (`*`, `?`, `[...]`; case-sensitive), sorted.
    pub async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT key FROM kv WHERE key GLOB ? ORDER BY key ASC",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to list keys matching {pattern}"))?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Remove `key`. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete key {key}"))?;

        Ok(result.rows_affected() > 0)
    }
}
