//! SQLite-backed mirror store. Every entity kind shares one keyed table; values are JSON.

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{EntityKind, RecordKey, Storage};
use crate::error::{StorageError, StorageResult};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        kind TEXT NOT NULL,
        target TEXT NOT NULL,
        id TEXT NOT NULL,
        ts INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (kind, target, id)
    );
    CREATE INDEX IF NOT EXISTS idx_records_range ON records(kind, target, ts);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl SqliteStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(classify)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(classify)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory().map_err(classify)?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA).map_err(classify)?;
        Ok(Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        })
    }

    /// After this every call reports [`StorageError::Unusable`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of stored records of `kind`.
    pub fn count(&self, kind: EntityKind) -> StorageResult<u64> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .map_err(classify)?;
        Ok(n as u64)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Unusable("store is closed".to_string()));
        }
        Ok(())
    }
}

impl Storage for SqliteStore {
    fn upsert(&self, kind: EntityKind, key: &RecordKey, value: &Value) -> StorageResult<()> {
        self.ensure_open()?;
        let json = serde_json::to_string(value)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO records (kind, target, id, ts, value) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![kind.as_str(), key.target, key.id, key.timestamp_ns, json],
            )
            .map_err(classify)?;
        Ok(())
    }

    fn query(&self, kind: EntityKind, target: &str, id: &str) -> StorageResult<Option<Value>> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM records WHERE kind = ?1 AND target = ?2 AND id = ?3",
                params![kind.as_str(), target, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(classify)?;
        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn query_range(
        &self,
        kind: EntityKind,
        target: &str,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<Value>> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT value FROM records WHERE kind = ?1 AND target = ?2 AND ts >= ?3 AND ts < ?4 \
                 ORDER BY ts, id",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map(params![kind.as_str(), target, from, to], |row| {
                row.get::<_, String>(0)
            })
            .map_err(classify)?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(classify)?;
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }
}

/// Errors after which the database cannot be trusted with further writes.
fn classify(e: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = e {
        if matches!(
            failure.code,
            ErrorCode::CannotOpen
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::ReadOnly
                | ErrorCode::DiskFull
                | ErrorCode::PermissionDenied
        ) {
            return StorageError::Unusable(e.to_string());
        }
    }
    StorageError::Sqlite(e)
}
