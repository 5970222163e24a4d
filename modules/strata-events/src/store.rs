//! EventLog: append-only record store backed by SQLite.
//!
//! The store assigns sequence numbers; `AUTOINCREMENT` guarantees they are never
//! reused. Appends go through a single writer lock so no two appends interleave.
//! Reads page through the table and hold no connection between pages, so a long
//! replay never blocks concurrent appends.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_stream::try_stream;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::registry::{DecodeError, TypeRegistry};
use crate::types::{AnyMessage, DecodedMessage, Message, StoredRecord};

pub const DEFAULT_BATCH_SIZE: usize = 500;

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Append-only record log. The single source of truth.
#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    types: Arc<TypeRegistry>,
    writer: Arc<Mutex<()>>,
    batch_size: usize,
}

impl EventLog {
    pub fn new(pool: SqlitePool, types: Arc<TypeRegistry>) -> Self {
        Self {
            pool,
            types,
            writer: Arc::new(Mutex::new(())),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Page size used by [`EventLog::read_from`].
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Bind `T::TYPE` so records of that type decode. First registration wins.
    pub fn register_type<T: Message>(&self) -> bool {
        self.types.register::<T>()
    }

    /// Durably append a message. Returns its sequence number.
    pub async fn append(&self, message: &dyn AnyMessage) -> Result<u64> {
        let type_tag = message.type_tag();
        let payload = message
            .to_payload()
            .with_context(|| format!("Failed to serialize {type_tag}"))?;

        let _writer = self.writer.lock().await;
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO events (ts, type_tag, payload)
            VALUES (?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(Utc::now())
        .bind(type_tag)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to append {type_tag}"))?;

        let seq = to_seq(row.0)?;
        debug!(seq, type_tag, "Appended record");
        Ok(seq)
    }

    /// The highest sequence number, or 0 if the log is empty.
    pub async fn current_version(&self) -> Result<u64> {
        let row = sqlx::query_as::<_, (Option<i64>,)>("SELECT MAX(seq) FROM events")
            .fetch_one(&self.pool)
            .await?;

        row.0.map(to_seq).transpose().map(|v| v.unwrap_or(0))
    }

    /// Lazily stream decoded messages with `seq > after`, ascending.
    ///
    /// Records whose tag is unregistered, or whose payload no longer decodes,
    /// are skipped with a warning. Records appended while the stream is being
    /// consumed are picked up by later pages.
    pub fn read_from(&self, after: u64) -> BoxStream<'static, Result<DecodedMessage>> {
        Box::pin(decoded_pages(self.clone(), after))
    }

    /// Lazily stream every raw record with `seq > after`, ascending, whether
    /// or not its tag is registered. Paged like [`EventLog::read_from`].
    pub fn read_raw_stream(&self, after: u64) -> BoxStream<'static, Result<StoredRecord>> {
        Box::pin(raw_pages(self.clone(), after))
    }

    /// Materialize a raw record through the type registry.
    pub fn decode(&self, record: StoredRecord) -> Result<DecodedMessage, DecodeError> {
        let value = self.types.decode(&record.type_tag, &record.payload)?;
        Ok(DecodedMessage { record, value })
    }

    /// One page of raw records with `seq > after`, ascending.
    pub async fn read_raw_from(&self, after: u64, limit: usize) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT seq, ts, type_tag, payload
            FROM events
            WHERE seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(to_db_seq(after)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Read a single record by sequence number.
    pub async fn read_record(&self, seq: u64) -> Result<Option<StoredRecord>> {
        let row = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT seq, ts, type_tag, payload
            FROM events
            WHERE seq = ?
            "#,
        )
        .bind(to_db_seq(seq)?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Record count per type tag, sorted by tag.
    pub async fn count_by_type(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT type_tag, COUNT(*)
            FROM events
            GROUP BY type_tag
            ORDER BY type_tag ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(tag, n)| Ok((tag, to_seq(n)?)))
            .collect()
    }
}

fn raw_pages(
    log: EventLog,
    after: u64,
) -> impl Stream<Item = Result<StoredRecord>> + Send + 'static {
    try_stream! {
        let mut cursor = after;
        loop {
            let page = log.read_raw_from(cursor, log.batch_size).await?;
            let exhausted = page.len() < log.batch_size;

            for record in page {
                cursor = record.seq;
                yield record;
            }

            if exhausted {
                break;
            }
        }
    }
}

fn decoded_pages(
    log: EventLog,
    after: u64,
) -> impl Stream<Item = Result<DecodedMessage>> + Send + 'static {
    try_stream! {
        let mut records = Box::pin(raw_pages(log.clone(), after));
        while let Some(record) = records.next().await {
            let record = record?;
            let seq = record.seq;
            match log.decode(record) {
                Ok(message) => {
                    yield message;
                }
                Err(e) => {
                    warn!(seq, error = %e, "Skipping undecodable record");
                }
            }
        }
    }
}

fn to_seq(raw: i64) -> Result<u64> {
    u64::try_from(raw).with_context(|| format!("Negative sequence number in log: {raw}"))
}

fn to_db_seq(seq: u64) -> Result<i64> {
    i64::try_from(seq).with_context(|| format!("Sequence number out of range: {seq}"))
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for StoredRecord
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let seq: i64 = row.try_get("seq")?;
        Ok(StoredRecord {
            seq: u64::try_from(seq).map_err(|e| sqlx::Error::ColumnDecode {
                index: "seq".into(),
                source: Box::new(e),
            })?,
            ts: row.try_get("ts")?,
            type_tag: row.try_get("type_tag")?,
            payload: row.try_get("payload")?,
        })
    }
}
