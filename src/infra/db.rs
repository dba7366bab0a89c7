//! SQLite handle shared by the duration store and the durable queues
//!
//! Every statement runs under one mutex per database file, so the stages that
//! share a file never interleave writes. Multi-statement operations take the
//! lock once and run inside a transaction.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors from the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt session state: {0}")]
    CorruptState(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cloneable handle to one SQLite database
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    label: Arc<str>,
}

impl Db {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;

        info!(path = %path.display(), "db_opened");
        Ok(Self { conn: Arc::new(Mutex::new(conn)), label: Arc::from(path.display().to_string()) })
    }

    /// In-memory database (tests)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), label: Arc::from(":memory:") })
    }

    /// Lock the connection for a sequence of statements
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("durations.sqlite");

        let db = Db::open(&path).unwrap();
        assert!(path.exists());
        assert!(db.label().ends_with("durations.sqlite"));
    }

    #[test]
    fn test_clones_share_connection() {
        let db = Db::in_memory().unwrap();
        let other = db.clone();

        db.lock().execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        other.lock().execute("INSERT INTO t (x) VALUES (1)", []).unwrap();

        let count: i64 = db.lock().query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
