//! SQLite-backed stores.
//!
//! The config record lives in a `device_config` table keyed by text key; the
//! queue lives in a `sync_queue` table keyed by reference. Both keep the
//! serialized record as JSON next to the columns used for lookups.
//!
//! rusqlite is synchronous and a busy database may block for up to
//! `busy_timeout`, so every statement runs on tokio's blocking pool.

use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::provider::{KeyValueStore, QueueStore};
use fieldsync_common::{Error, QueuedRecord, Reference, Result};

fn map_sqlite(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DiskFull => {
            Error::QuotaExceeded(err.to_string())
        }
        _ => Error::Storage(err.to_string()),
    }
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path).map_err(map_sqlite)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        PRAGMA busy_timeout = 5000;
        "#,
    )
    .map_err(map_sqlite)?;
    Ok(conn)
}

type SharedConnection = Arc<Mutex<Connection>>;

/// Run `op` against the connection on the blocking pool.
async fn with_conn<T, F>(conn: &SharedConnection, op: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let guard = conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
        op(&guard)
    })
    .await
    .map_err(|e| Error::Storage(format!("sqlite task failed: {}", e)))?
}

/// Key/value store over a single SQLite table.
pub struct SqliteStore {
    conn: SharedConnection,
}

impl SqliteStore {
    /// Create or open the store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_connection(db_path.as_ref())?;
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS device_config (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(map_sqlite)?;

        info!("Config database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        with_conn(&self.conn, move |conn| {
            conn.query_row(
                "SELECT value FROM device_config WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(map_sqlite)
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = key.to_string();
        let value = value.to_vec();
        with_conn(&self.conn, move |conn| {
            conn.execute(
                r#"
                INSERT INTO device_config (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
                params![
                    key,
                    value,
                    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
                ],
            )
            .map_err(map_sqlite)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        with_conn(&self.conn, move |conn| {
            conn.execute("DELETE FROM device_config WHERE key = ?1", params![key])
                .map_err(map_sqlite)?;
            Ok(())
        })
        .await
    }
}

/// Queue store over the `sync_queue` table.
pub struct SqliteQueueStore {
    conn: SharedConnection,
}

impl SqliteQueueStore {
    /// Create or open the queue database.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_connection(db_path.as_ref())?;
        Self::init(conn)
    }

    /// Create an in-memory queue (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                reference TEXT PRIMARY KEY,
                superseded_reference TEXT,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue(created_at);
            CREATE INDEX IF NOT EXISTS idx_sync_queue_superseded ON sync_queue(superseded_reference);
            "#,
        )
        .map_err(map_sqlite)?;

        info!("Queue database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn decode(body: String) -> rusqlite::Result<QueuedRecord> {
        serde_json::from_str(&body).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    }

    /// Look up one record body by a `?1`-parameterized query.
    async fn query_one(&self, sql: &'static str, reference: &Reference) -> Result<Option<QueuedRecord>> {
        let reference = reference.to_string();
        with_conn(&self.conn, move |conn| {
            conn.query_row(sql, params![reference], |row| Self::decode(row.get(0)?))
                .optional()
                .map_err(map_sqlite)
        })
        .await
    }
}

fn created_key(record: &QueuedRecord) -> String {
    record
        .created_at
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Column values written for a record, detached from the borrow.
struct Row {
    reference: String,
    superseded: Option<String>,
    kind: &'static str,
    status: &'static str,
    created_at: String,
    body: String,
}

impl Row {
    fn from_record(record: &QueuedRecord) -> Result<Self> {
        Ok(Self {
            reference: record.reference.to_string(),
            superseded: record.superseded_reference.as_ref().map(|r| r.to_string()),
            kind: record.kind.as_str(),
            status: record.status.as_str(),
            created_at: created_key(record),
            body: serde_json::to_string(record)?,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert_if_absent(&self, record: &QueuedRecord) -> Result<bool> {
        let row = Row::from_record(record)?;
        let inserted = with_conn(&self.conn, move |conn| {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO sync_queue
                (reference, superseded_reference, type, status, created_at, body)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    row.reference,
                    row.superseded,
                    row.kind,
                    row.status,
                    row.created_at,
                    row.body,
                ],
            )
            .map_err(map_sqlite)
        })
        .await?;
        debug!("Queue insert {}: {}", record.reference, inserted == 1);
        Ok(inserted == 1)
    }

    async fn get(&self, reference: &Reference) -> Result<Option<QueuedRecord>> {
        self.query_one("SELECT body FROM sync_queue WHERE reference = ?1", reference)
            .await
    }

    async fn find(&self, reference: &Reference) -> Result<Option<QueuedRecord>> {
        self.query_one(
            r#"
            SELECT body FROM sync_queue
            WHERE reference = ?1 OR superseded_reference = ?1
            LIMIT 1
            "#,
            reference,
        )
        .await
    }

    async fn list(&self) -> Result<Vec<QueuedRecord>> {
        with_conn(&self.conn, |conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM sync_queue ORDER BY created_at, rowid")
                .map_err(map_sqlite)?;
            let rows = stmt
                .query_map([], |row| Self::decode(row.get(0)?))
                .map_err(map_sqlite)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite)
        })
        .await
    }

    async fn update(&self, previous: &Reference, record: &QueuedRecord) -> Result<()> {
        let row = Row::from_record(record)?;
        let previous_key = previous.to_string();
        let changed = with_conn(&self.conn, move |conn| {
            conn.execute(
                r#"
                UPDATE sync_queue
                SET reference = ?1, superseded_reference = ?2, type = ?3,
                    status = ?4, created_at = ?5, body = ?6
                WHERE reference = ?7
                "#,
                params![
                    row.reference,
                    row.superseded,
                    row.kind,
                    row.status,
                    row.created_at,
                    row.body,
                    previous_key,
                ],
            )
            .map_err(map_sqlite)
        })
        .await?;
        if changed == 0 {
            return Err(Error::NotFound(format!("queued record {}", previous)));
        }
        Ok(())
    }

    async fn remove(&self, reference: &Reference) -> Result<bool> {
        let reference = reference.to_string();
        let removed = with_conn(&self.conn, move |conn| {
            conn.execute(
                "DELETE FROM sync_queue WHERE reference = ?1",
                params![reference],
            )
            .map_err(map_sqlite)
        })
        .await?;
        Ok(removed > 0)
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = with_conn(&self.conn, |conn| {
            conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
                .map_err(map_sqlite)
        })
        .await?;
        Ok(count as usize)
    }
}
