//! PostgreSQL Event Source
//!
//! Reads the replicated event log table and the resource table from the
//! secondary's read-only copy of the primary database.

use std::collections::HashSet;
use std::time::Duration;

use chrono::NaiveDateTime;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{EventId, EventRecord, EventSource};
use crate::config::EventSourceConfig;
use crate::error::Result;
use crate::node::ResourcePolicy;

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    event_type: String,
    payload: Option<serde_json::Value>,
    created_at: NaiveDateTime,
    resource_id: Option<i64>,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            event_type: row.event_type,
            payload: row.payload,
            created_at: row.created_at.and_utc(),
            resource_id: row.resource_id,
        }
    }
}

/// Build a pool using the event source settings.
///
/// Connections are opened on first use, so a database that is down at
/// startup shows up as a failed work cycle rather than a failed boot.
/// Only a malformed URL is rejected here.
pub fn connect(config: &EventSourceConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect_lazy(&config.url)?;
    Ok(pool)
}


/// Event log table reader
pub struct PgEventSource {
    pool: PgPool,
    select_sql: String,
    find_sql: String,
    max_sql: String,
}

impl PgEventSource {
    /// Create a reader over `table`; the name must already be validated
    pub fn new(pool: PgPool, table: &str) -> Self {
        let columns = "id, event_type, payload, created_at, resource_id";
        Self {
            pool,
            select_sql: format!(
                "SELECT {columns} FROM {table} WHERE id > $1 ORDER BY id ASC LIMIT $2"
            ),
            find_sql: format!("SELECT {columns} FROM {table} WHERE id = $1"),
            max_sql: format!("SELECT MAX(id) FROM {table}"),
        }
    }
}

#[async_trait::async_trait]
impl EventSource for PgEventSource {
    async fn find_by_id(&self, id: EventId) -> Result<Option<EventRecord>> {
        let row = sqlx::query_as::<_, EventRow>(&self.find_sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EventRecord::from))
    }

    async fn events_after(&self, after: EventId, limit: usize) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(&self.select_sql)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn max_id(&self) -> Result<Option<EventId>> {
        let max: Option<i64> = sqlx::query_scalar(&self.max_sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }
}

/// Resource policy backed by the resource table and a selective sync list
pub struct PgResourcePolicy {
    pool: PgPool,
    exists_sql: String,
    /// Empty means every resource is replicated
    selected: HashSet<i64>,
}

impl PgResourcePolicy {
    /// Create a policy over `resource_table`; the name must already be validated
    pub fn new(pool: PgPool, resource_table: &str, selected: impl IntoIterator<Item = i64>) -> Self {
        Self {
            pool,
            exists_sql: format!("SELECT EXISTS(SELECT 1 FROM {resource_table} WHERE id = $1)"),
            selected: selected.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl ResourcePolicy for PgResourcePolicy {
    async fn resource_exists(&self, resource_id: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(&self.exists_sql)
            .bind(resource_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn resource_relevant(&self, resource_id: i64) -> Result<bool> {
        Ok(self.selected.is_empty() || self.selected.contains(&resource_id))
    }
}
