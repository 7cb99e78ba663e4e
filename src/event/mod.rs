//! Event Log Module
//!
//! Read-only view of the replication event log written by the primary.
//! Ids are unique and increasing, but a lower id may become visible to
//! a reader after a higher one.

mod memory;
pub mod postgres;

pub use memory::MemoryEventSource;
pub use postgres::{PgEventSource, PgResourcePolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Event log identifier
pub type EventId = i64;

/// Position used when nothing has been processed and the log is empty
pub const NO_EVENT: EventId = -1;

/// A single entry of the primary's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Log id, assigned by the primary on write
    pub id: EventId,
    /// Discriminator used to pick a handler
    pub event_type: String,
    /// Type-specific attributes; `None` when the referenced event row is gone
    pub payload: Option<serde_json::Value>,
    /// When the primary created the event
    pub created_at: DateTime<Utc>,
    /// Resource (project) the event belongs to, `None` for global events
    pub resource_id: Option<i64>,
}

impl EventRecord {
    /// Create an event with a payload, created now
    pub fn new(id: EventId, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload: Some(payload),
            created_at: Utc::now(),
            resource_id: None,
        }
    }

    /// Attach the event to a resource
    pub fn with_resource(mut self, resource_id: i64) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    /// Drop the payload, as happens when its subject was hard-deleted
    pub fn without_payload(mut self) -> Self {
        self.payload = None;
        self
    }

    /// Override the creation time
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Source of replication events
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    /// Look up a single event by id
    async fn find_by_id(&self, id: EventId) -> Result<Option<EventRecord>>;

    /// Events with `id > after`, ascending, at most `limit`
    async fn events_after(&self, after: EventId, limit: usize) -> Result<Vec<EventRecord>>;

    /// Highest visible id, `None` when the log is empty
    async fn max_id(&self) -> Result<Option<EventId>>;
}
