//! Durable storage for download records and runtime settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mediafetch_core::models::record::{DownloadRecord, DownloadStatus, FormatType};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{QueueError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS downloads (
        id TEXT PRIMARY KEY NOT NULL,
        url TEXT NOT NULL,
        title TEXT NOT NULL DEFAULT '',
        thumbnail_url TEXT,
        duration_seconds INTEGER,
        file_size_bytes INTEGER,
        format_type TEXT NOT NULL,
        quality TEXT NOT NULL,
        codec TEXT NOT NULL,
        bitrate INTEGER NOT NULL,
        output_path TEXT NOT NULL,
        resolved_filename TEXT,
        status TEXT NOT NULL,
        progress_percent INTEGER NOT NULL DEFAULT 0,
        speed_bytes_per_sec REAL NOT NULL DEFAULT 0,
        eta_seconds INTEGER,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status)",
    "CREATE INDEX IF NOT EXISTS idx_downloads_created_at ON downloads(created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )
    "#,
];

/// Aggregates over the whole history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreTotals {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub completed_bytes: u64,
}

/// Record persistence. `put` is an idempotent upsert keyed by id and is
/// durable once it returns.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn put(&self, record: &DownloadRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>>;

    /// Records whose status is in `statuses` (all when `None`), ordered by
    /// creation time.
    async fn list(
        &self,
        statuses: Option<&[DownloadStatus]>,
        limit: Option<u32>,
        newest_first: bool,
    ) -> Result<Vec<DownloadRecord>>;

    /// Retention sweep. Returns the number of rows removed.
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[DownloadStatus],
    ) -> Result<u64>;

    async fn totals(&self) -> Result<StoreTotals>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    async fn close(&self);
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{}': {}", s, e))
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    url: String,
    title: String,
    thumbnail_url: Option<String>,
    duration_seconds: Option<i64>,
    file_size_bytes: Option<i64>,
    format_type: String,
    quality: String,
    codec: String,
    bitrate: i64,
    output_path: String,
    resolved_filename: Option<String>,
    status: String,
    progress_percent: i64,
    speed_bytes_per_sec: f64,
    eta_seconds: Option<i64>,
    created_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    max_retries: i64,
}

impl TryFrom<RecordRow> for DownloadRecord {
    type Error = String;

    fn try_from(row: RecordRow) -> std::result::Result<Self, Self::Error> {
        Ok(DownloadRecord {
            status: DownloadStatus::from_str(&row.status)?,
            format_type: FormatType::from_str(&row.format_type)?,
            created_at: parse_timestamp(&row.created_at)?,
            completed_at: row.completed_at.as_deref().map(parse_timestamp).transpose()?,
            id: row.id,
            url: row.url,
            title: row.title,
            thumbnail_url: row.thumbnail_url,
            duration_seconds: row.duration_seconds.map(to_u64),
            file_size_bytes: row.file_size_bytes.map(to_u64),
            quality: row.quality,
            codec: row.codec,
            bitrate: u32::try_from(row.bitrate).unwrap_or(0),
            output_path: PathBuf::from(row.output_path),
            resolved_filename: row.resolved_filename,
            progress_percent: row.progress_percent.clamp(0, 100) as u8,
            speed_bytes_per_sec: row.speed_bytes_per_sec,
            eta_seconds: row.eta_seconds.map(to_u64),
            error_message: row.error_message,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            max_retries: u32::try_from(row.max_retries).unwrap_or(0),
        })
    }
}

/// SQLite store behind a small sqlx pool.
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("record store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database. A single connection that never expires, so
    /// the data lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| QueueError::store("migrate", e))?;
        }
        Ok(())
    }

    fn push_status_filter(qb: &mut QueryBuilder<'_, Sqlite>, statuses: &[DownloadStatus]) {
        qb.push("status IN (");
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn put(&self, record: &DownloadRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, url, title, thumbnail_url, duration_seconds, file_size_bytes,
                format_type, quality, codec, bitrate, output_path, resolved_filename,
                status, progress_percent, speed_bytes_per_sec, eta_seconds,
                created_at, completed_at, error_message, retry_count, max_retries
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                thumbnail_url = excluded.thumbnail_url,
                duration_seconds = excluded.duration_seconds,
                file_size_bytes = excluded.file_size_bytes,
                format_type = excluded.format_type,
                quality = excluded.quality,
                codec = excluded.codec,
                bitrate = excluded.bitrate,
                output_path = excluded.output_path,
                resolved_filename = excluded.resolved_filename,
                status = excluded.status,
                progress_percent = excluded.progress_percent,
                speed_bytes_per_sec = excluded.speed_bytes_per_sec,
                eta_seconds = excluded.eta_seconds,
                created_at = excluded.created_at,
                completed_at = excluded.completed_at,
                error_message = excluded.error_message,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries
            "#,
        )
        .bind(&record.id)
        .bind(&record.url)
        .bind(&record.title)
        .bind(&record.thumbnail_url)
        .bind(record.duration_seconds.map(to_i64))
        .bind(record.file_size_bytes.map(to_i64))
        .bind(record.format_type.as_str())
        .bind(&record.quality)
        .bind(&record.codec)
        .bind(i64::from(record.bitrate))
        .bind(record.output_path.to_string_lossy().to_string())
        .bind(&record.resolved_filename)
        .bind(record.status.as_str())
        .bind(i64::from(record.progress_percent))
        .bind(record.speed_bytes_per_sec)
        .bind(record.eta_seconds.map(to_i64))
        .bind(timestamp(&record.created_at))
        .bind(record.completed_at.as_ref().map(timestamp))
        .bind(&record.error_message)
        .bind(i64::from(record.retry_count))
        .bind(i64::from(record.max_retries))
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::store("put", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query_as::<_, RecordRow>("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::store("get", e))?;

        row.map(DownloadRecord::try_from)
            .transpose()
            .map_err(|e| QueueError::store("get", e))
    }

    async fn list(
        &self,
        statuses: Option<&[DownloadStatus]>,
        limit: Option<u32>,
        newest_first: bool,
    ) -> Result<Vec<DownloadRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM downloads");
        if let Some(statuses) = statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" WHERE ");
            Self::push_status_filter(&mut qb, statuses);
        }
        qb.push(if newest_first {
            " ORDER BY created_at DESC"
        } else {
            " ORDER BY created_at ASC"
        });
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::store("list", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match DownloadRecord::try_from(row) {
                Ok(record) => records.push(record),
                Err(e) => warn!("[{}] skipping unreadable row: {}", id, e),
            }
        }
        Ok(records)
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[DownloadStatus],
    ) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM downloads WHERE created_at < ");
        qb.push_bind(timestamp(&cutoff));
        qb.push(" AND ");
        Self::push_status_filter(&mut qb, statuses);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::store("delete", e))?;
        Ok(result.rows_affected())
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let (total, completed, failed, bytes): (i64, Option<i64>, Option<i64>, Option<i64>) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'completed' THEN COALESCE(file_size_bytes, 0) ELSE 0 END)
                FROM downloads
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::store("totals", e))?;

        Ok(StoreTotals {
            total: to_u64(total),
            completed: to_u64(completed.unwrap_or(0)),
            failed: to_u64(failed.unwrap_or(0)),
            completed_bytes: to_u64(bytes.unwrap_or(0)),
        })
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::store("get_setting", e))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::store("set_setting", e))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Process-lifetime store used when the database cannot be opened.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, DownloadRecord>>,
    settings: RwLock<HashMap<String, String>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, record: &DownloadRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(
        &self,
        statuses: Option<&[DownloadStatus]>,
        limit: Option<u32>,
        newest_first: bool,
    ) -> Result<Vec<DownloadRecord>> {
        let mut records: Vec<DownloadRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| statuses.is_none_or(|s| s.contains(&r.status)))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        if newest_first {
            records.reverse();
        }
        if let Some(limit) = limit {
            records.truncate(limit as usize);
        }
        Ok(records)
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[DownloadStatus],
    ) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.created_at < cutoff && statuses.contains(&r.status)));
        Ok((before - records.len()) as u64)
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let records = self.records.read().await;
        let mut totals = StoreTotals {
            total: records.len() as u64,
            ..Default::default()
        };
        for r in records.values() {
            match r.status {
                DownloadStatus::Completed => {
                    totals.completed += 1;
                    totals.completed_bytes += r.file_size_bytes.unwrap_or(0);
                }
                DownloadStatus::Failed => totals.failed += 1,
                _ => {}
            }
        }
        Ok(totals)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.settings.read().await.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.settings
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn close(&self) {}
}

/// Opens the SQLite store at `path`, falling back to a memory store for the
/// rest of the process when that fails.
pub async fn open_store(path: &Path) -> Arc<dyn RecordStore> {
    match SqliteRecordStore::open(path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                "record store unavailable at {} ({}); history will not survive this session",
                path.display(),
                e
            );
            Arc::new(MemoryRecordStore::new())
        }
    }
}
