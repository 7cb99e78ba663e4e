//! State Tracker
//!
//! SQLite-backed storage for the cursor position, the gap set and lease
//! keys. Cursor processes on the same host point at the same database
//! file; WAL journaling plus a busy timeout lets them share it.

use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{
    expiry_after, from_millis, remaining_until, to_millis, CursorStore, GapRecord, GapStore,
    LockAttempt, LockHolder, LockStore,
};
use crate::event::EventId;
use crate::error::{Error, Result};

const CURSOR_KEY: &str = "last_processed_event_id";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Mutex<Connection>,
    /// Path to the database file
    path: PathBuf,
}

impl StateTracker {
    /// Create or open the state database in `state_dir`
    pub fn new(state_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&state_dir)?;

        let db_path = state_dir.join("cursor.db");
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cursor_state (
                key TEXT PRIMARY KEY,
                event_id INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_log_gaps (
                event_id INTEGER PRIMARY KEY,
                recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_event_log_gaps_recorded_at
                ON event_log_gaps(recorded_at);

            CREATE TABLE IF NOT EXISTS leases (
                key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )?;

        tracing::debug!("Opened state database at {}", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Oldest pending gap, if any
    pub async fn oldest_gap(&self) -> Result<Option<GapRecord>> {
        let conn = self.conn.lock().await;
        let gap = conn
            .query_row(
                "SELECT event_id, recorded_at FROM event_log_gaps ORDER BY recorded_at, event_id LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(gap.map(|(event_id, recorded_at)| GapRecord {
            event_id,
            recorded_at: from_millis(recorded_at),
        }))
    }
}

#[async_trait::async_trait]
impl CursorStore for StateTracker {
    async fn last_processed(&self) -> Result<Option<EventId>> {
        let conn = self.conn.lock().await;
        let id = conn
            .query_row(
                "SELECT event_id FROM cursor_state WHERE key = ?1",
                params![CURSOR_KEY],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id)
    }

    async fn save_processed(&self, event_id: EventId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO cursor_state (key, event_id, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                event_id = MAX(event_id, excluded.event_id),
                updated_at = excluded.updated_at
            "#,
            params![CURSOR_KEY, event_id, to_millis(Utc::now())],
        )?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl GapStore for StateTracker {
    async fn add(&self, event_id: EventId, recorded_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO event_log_gaps (event_id, recorded_at) VALUES (?1, ?2)",
            params![event_id, to_millis(recorded_at)],
        )?;
        Ok(())
    }

    async fn remove(&self, event_id: EventId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM event_log_gaps WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(())
    }

    async fn range(&self, max_recorded_at: DateTime<Utc>) -> Result<Vec<GapRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT event_id, recorded_at FROM event_log_gaps WHERE recorded_at <= ?1 ORDER BY recorded_at, event_id",
        )?;
        let rows = stmt.query_map(params![to_millis(max_recorded_at)], |row| {
            Ok(GapRecord {
                event_id: row.get(0)?,
                recorded_at: from_millis(row.get(1)?),
            })
        })?;

        let mut gaps = Vec::new();
        for result in rows {
            gaps.push(result?);
        }

        Ok(gaps)
    }

    async fn evict(&self, before: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM event_log_gaps WHERE recorded_at <= ?1",
            params![to_millis(before)],
        )?;
        Ok(deleted as u64)
    }

    async fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM event_log_gaps", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait::async_trait]
impl LockStore for StateTracker {
    async fn set_if_not_exists(&self, key: &str, token: &str, ttl: Duration) -> Result<LockAttempt> {
        let now = to_millis(Utc::now());
        let expires_at = expiry_after(now, ttl);

        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
            INSERT INTO leases (key, token, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
            WHERE leases.expires_at <= ?4 OR leases.token = excluded.token
            "#,
            params![key, token, expires_at, now],
        )?;

        if changed > 0 {
            return Ok(LockAttempt::Acquired);
        }

        let holder_expires: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM leases WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(LockAttempt::Held {
            remaining: remaining_until(holder_expires.unwrap_or(now), now),
        })
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = to_millis(Utc::now());
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE leases SET expires_at = ?3 WHERE key = ?1 AND token = ?2 AND expires_at > ?4",
            params![key, token, expiry_after(now, ttl), now],
        )?;
        Ok(changed > 0)
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM leases WHERE key = ?1 AND token = ?2",
            params![key, token],
        )?;
        Ok(changed > 0)
    }

    async fn holder(&self, key: &str) -> Result<Option<LockHolder>> {
        let now = to_millis(Utc::now());
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT token, expires_at FROM leases WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(token, expires_at)| LockHolder {
            token,
            remaining: remaining_until(expires_at, now),
        }))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}
