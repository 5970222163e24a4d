//! Connection setup and schema. Both tables are created on first use.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

/// Open (or create) the database at `url`.
///
/// File databases run in WAL mode so readers never block the single writer.
/// In-memory databases are pinned to one long-lived connection, since every
/// SQLite connection to `:memory:` would otherwise see its own empty database.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");

    let mut options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database URL: {url}"))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
    } else {
        options = options.journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
    }
    .with_context(|| format!("Failed to open database: {url}"))?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Fresh private in-memory database with the schema applied.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    connect("sqlite::memory:").await
}

/// Create the log and key-value tables if absent. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            seq       INTEGER PRIMARY KEY AUTOINCREMENT,
            ts        TEXT    NOT NULL,
            type_tag  TEXT    NOT NULL,
            payload   TEXT    NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create events table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            key    TEXT PRIMARY KEY,
            value  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create kv table")?;

    debug!("Schema ready");
    Ok(())
}
