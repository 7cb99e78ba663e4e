//! In-memory event log
//!
//! Events are only returned once published, which makes it possible to
//! reproduce out-of-order visibility: publish 5 before 3 and a reader
//! sees a hole at 3 until it is published.

use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{EventId, EventRecord, EventSource};
use crate::error::{Error, Result};

/// Event source backed by an ordered map
#[derive(Default)]
pub struct MemoryEventSource {
    events: RwLock<BTreeMap<EventId, EventRecord>>,
    /// When set, every query fails (simulates a dropped connection)
    unavailable: RwLock<bool>,
}

impl MemoryEventSource {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log with events already visible
    pub fn with_events(events: impl IntoIterator<Item = EventRecord>) -> Self {
        let map = events.into_iter().map(|e| (e.id, e)).collect();
        Self {
            events: RwLock::new(map),
            unavailable: RwLock::new(false),
        }
    }

    /// Make an event visible
    pub async fn publish(&self, event: EventRecord) {
        self.events.write().await.insert(event.id, event);
    }

    /// Remove an event, as a primary purging rows of a deleted project would
    pub async fn purge(&self, id: EventId) {
        self.events.write().await.remove(&id);
    }

    /// Toggle simulated unavailability
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    async fn ensure_available(&self) -> Result<()> {
        if *self.unavailable.read().await {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "event source unavailable",
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventSource for MemoryEventSource {
    async fn find_by_id(&self, id: EventId) -> Result<Option<EventRecord>> {
        self.ensure_available().await?;
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn events_after(&self, after: EventId, limit: usize) -> Result<Vec<EventRecord>> {
        self.ensure_available().await?;
        let events = self.events.read().await;
        Ok(events
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn max_id(&self) -> Result<Option<EventId>> {
        self.ensure_available().await?;
        Ok(self.events.read().await.keys().next_back().copied())
    }
}
