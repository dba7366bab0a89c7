//! Duration ledger on SQLite
//!
//! Three tables back the presence pipeline:
//! - `ephemeral_durations` - live intervals keyed by hardware address
//! - `durations` - anonymised intervals of completed sessions
//! - `session_state` - current session id and start time

use crate::domain::types::{EphemeralDuration, SessionDuration, SessionId};
use crate::infra::db::{Db, StoreError, StoreResult};
use rusqlite::{params, OptionalExtension, Row};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ephemeral_durations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier TEXT NOT NULL,
    manufacturer TEXT NOT NULL DEFAULT 'unknown',
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    open INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_ephemeral_open
    ON ephemeral_durations(identifier) WHERE open = 1;
CREATE TABLE IF NOT EXISTS durations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    patron_index INTEGER NOT NULL,
    manufacturer TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_durations_session ON durations(session_id);
CREATE TABLE IF NOT EXISTS session_state (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

const KEY_SESSION_ID: &str = "session_id";
const KEY_SESSION_STARTED: &str = "session_started_at";

/// Row changes computed by one observation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntervalChanges {
    /// Open interval ids whose end moves to `now`
    pub extend: Vec<i64>,
    /// (identifier, manufacturer) pairs that open a new interval at `now`
    pub create: Vec<(String, String)>,
    /// Open interval ids that were missed and become frozen
    pub close: Vec<i64>,
}

impl IntervalChanges {
    pub fn is_empty(&self) -> bool {
        self.extend.is_empty() && self.create.is_empty() && self.close.is_empty()
    }
}

/// Persisted position of the session counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub id: SessionId,
    pub started_at: i64,
}

/// Duration ledger
#[derive(Clone)]
pub struct DurationStore {
    db: Db,
}

impl DurationStore {
    pub fn new(db: Db) -> StoreResult<Self> {
        db.lock().execute_batch(SCHEMA)?;
        Ok(Self { db })
    }

    /// Open intervals as identifier -> row id
    pub fn open_intervals(&self) -> StoreResult<FxHashMap<String, i64>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT identifier, id FROM ephemeral_durations WHERE open = 1")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut open = FxHashMap::default();
        for row in rows {
            let (identifier, id) = row?;
            open.insert(identifier, id);
        }
        Ok(open)
    }

    /// Apply one observation's changes atomically
    pub fn apply_changes(&self, changes: &IntervalChanges, now: i64) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut extend = tx.prepare_cached(
                "UPDATE ephemeral_durations SET end_ts = MAX(end_ts, ?1) WHERE id = ?2 AND open = 1",
            )?;
            for id in &changes.extend {
                extend.execute(params![now, id])?;
            }

            let mut create = tx.prepare_cached(
                "INSERT INTO ephemeral_durations (identifier, manufacturer, start_ts, end_ts, open)
                 VALUES (?1, ?2, ?3, ?3, 1)",
            )?;
            for (identifier, manufacturer) in &changes.create {
                create.execute(params![identifier, manufacturer, now])?;
            }

            let mut close =
                tx.prepare_cached("UPDATE ephemeral_durations SET open = 0 WHERE id = ?1")?;
            for id in &changes.close {
                close.execute(params![id])?;
            }
        }
        tx.commit()?;

        debug!(
            extended = changes.extend.len(),
            created = changes.create.len(),
            closed = changes.close.len(),
            now = now,
            "intervals_applied"
        );
        Ok(())
    }

    /// All intervals for an identifier, oldest first
    pub fn intervals_for(&self, identifier: &str) -> StoreResult<Vec<EphemeralDuration>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, identifier, manufacturer, start_ts, end_ts, open
             FROM ephemeral_durations WHERE identifier = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![identifier], ephemeral_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every live interval, oldest first
    pub fn all_intervals(&self) -> StoreResult<Vec<EphemeralDuration>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, identifier, manufacturer, start_ts, end_ts, open
             FROM ephemeral_durations ORDER BY id",
        )?;
        let rows = stmt.query_map([], ephemeral_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Current session, initialised at `now` the first time the ledger is used
    pub fn session_state_or_init(&self, now: i64) -> StoreResult<SessionState> {
        let conn = self.db.lock();
        let id = read_state(&conn, KEY_SESSION_ID)?;
        let started = read_state(&conn, KEY_SESSION_STARTED)?;

        match (id, started) {
            (Some(id), Some(started_at)) => Ok(SessionState { id: SessionId(id), started_at }),
            (None, None) => {
                let state = SessionState { id: SessionId(1), started_at: now };
                write_state(&conn, KEY_SESSION_ID, state.id.0)?;
                write_state(&conn, KEY_SESSION_STARTED, state.started_at)?;
                info!(session_id = %state.id, started_at = now, "session_state_initialized");
                Ok(state)
            }
            (id, started) => Err(StoreError::CorruptState(format!(
                "session_id={id:?} session_started_at={started:?}"
            ))),
        }
    }

    /// Whether `session` has been closed and its durations filed
    ///
    /// Only sessions older than the current one qualify. The token of a
    /// rotating session is queued before its rows are filed, so consumers
    /// check this before trusting what `durations_for_session` returns.
    pub fn is_filed(&self, session: SessionId) -> StoreResult<bool> {
        let conn = self.db.lock();
        Ok(read_state(&conn, KEY_SESSION_ID)?.is_some_and(|current| session.0 < current))
    }

    /// Freeze every live interval into `session` and start the next one
    ///
    /// Runs in one transaction. Rows already filed under `session` are
    /// replaced, so closing the same session twice is harmless.
    /// Returns the number of durations filed.
    pub fn close_session(&self, session: SessionId, next_started_at: i64) -> StoreResult<usize> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let intervals: Vec<(String, i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT manufacturer, start_ts, end_ts FROM ephemeral_durations
                 ORDER BY start_ts, id",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        tx.execute("DELETE FROM durations WHERE session_id = ?1", params![session.0])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO durations (session_id, patron_index, manufacturer, start_ts, end_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (patron_index, (manufacturer, start, end)) in intervals.iter().enumerate() {
                insert.execute(params![session.0, patron_index as i64, manufacturer, start, end])?;
            }
        }
        tx.execute("DELETE FROM ephemeral_durations", [])?;
        write_state(&tx, KEY_SESSION_ID, session.next().0)?;
        write_state(&tx, KEY_SESSION_STARTED, next_started_at)?;
        tx.commit()?;

        info!(
            session_id = %session,
            durations = intervals.len(),
            next_session_id = %session.next(),
            "session_closed"
        );
        Ok(intervals.len())
    }

    /// Durations filed under a session, in patron order
    ///
    /// Rows that fail to decode or have `start > end` are logged and skipped.
    pub fn durations_for_session(&self, session: SessionId) -> StoreResult<Vec<SessionDuration>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, patron_index, manufacturer, start_ts, end_ts
             FROM durations WHERE session_id = ?1 ORDER BY patron_index",
        )?;
        let rows = stmt.query_map(params![session.0], |row| {
            Ok(SessionDuration {
                session_id: SessionId(row.get(0)?),
                patron_index: row.get(1)?,
                manufacturer: row.get(2)?,
                start: row.get(3)?,
                end: row.get(4)?,
            })
        })?;

        let mut durations = Vec::new();
        for row in rows {
            match row {
                Ok(d) if d.start <= d.end => durations.push(d),
                Ok(d) => {
                    warn!(
                        session_id = %session,
                        patron_index = d.patron_index,
                        start = d.start,
                        end = d.end,
                        "duration_inverted_skipped"
                    );
                }
                Err(e) => {
                    warn!(session_id = %session, error = %e, "duration_row_skipped");
                }
            }
        }
        Ok(durations)
    }
}

fn ephemeral_from_row(row: &Row<'_>) -> rusqlite::Result<EphemeralDuration> {
    Ok(EphemeralDuration {
        id: row.get(0)?,
        identifier: row.get(1)?,
        manufacturer: row.get(2)?,
        start: row.get(3)?,
        end: row.get(4)?,
        open: row.get::<_, i64>(5)? != 0,
    })
}

fn read_state(conn: &rusqlite::Connection, key: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row("SELECT value FROM session_state WHERE key = ?1", params![key], |r| r.get(0))
        .optional()?)
}

fn write_state(conn: &rusqlite::Connection, key: &str, value: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO session_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
