//! Durable at-least-once work queue
//!
//! Tokens are removed only after their consumer reports full success, so any
//! interruption leaves the token for the next pass. Consumers must therefore be
//! safe to re-run on the same token. Several named queues share one table.

use crate::infra::db::{Db, StoreResult};
use rusqlite::params;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    token TEXT NOT NULL,
    UNIQUE(name, token)
);
";

/// Queue of completed sessions waiting for chart rendering
pub const IMAGES_QUEUE: &str = "images";
/// Queue of completed sessions waiting for remote export
pub const SENDS_QUEUE: &str = "sends";

#[derive(Clone)]
pub struct DurableQueue {
    db: Db,
    name: String,
}

impl DurableQueue {
    pub fn new(db: Db, name: &str) -> StoreResult<Self> {
        db.lock().execute_batch(SCHEMA)?;
        Ok(Self { db, name: name.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a token; a token already pending keeps its original position
    pub fn enqueue(&self, token: &str) -> StoreResult<()> {
        let inserted = self.db.lock().execute(
            "INSERT OR IGNORE INTO queue (name, token) VALUES (?1, ?2)",
            params![self.name, token],
        )?;
        debug!(queue = %self.name, token = %token, inserted = inserted > 0, "queue_enqueued");
        Ok(())
    }

    /// Pending tokens in insertion order
    pub fn as_list(&self) -> StoreResult<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT token FROM queue WHERE name = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![self.name], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop a token after its consumer succeeded
    pub fn remove(&self, token: &str) -> StoreResult<()> {
        let removed = self.db.lock().execute(
            "DELETE FROM queue WHERE name = ?1 AND token = ?2",
            params![self.name, token],
        )?;
        debug!(queue = %self.name, token = %token, removed = removed > 0, "queue_removed");
        Ok(())
    }

    pub fn len(&self) -> StoreResult<usize> {
        let count: i64 = self.db.lock().query_row(
            "SELECT COUNT(*) FROM queue WHERE name = ?1",
            params![self.name],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}
