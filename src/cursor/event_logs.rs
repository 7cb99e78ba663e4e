//! Event Log Reader
//!
//! Pulls events strictly by id in bounded batches, starting right after the
//! persisted cursor position. The position only moves after the caller has
//! dispatched a whole batch, so a crash replays from the last safe boundary.
//!
//! ```text
//! next_batch() -> dispatch every event -> mark_processed()
//!                 (crash here = batch is read again)
//! ```

use std::sync::Arc;

use crate::event::{EventId, EventRecord, EventSource, NO_EVENT};
use crate::state::{CursorStore, Lease};
use crate::error::Result;

/// Default number of events per batch
pub const BATCH_SIZE: usize = 50;

/// A chunk of consecutive visible events
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// Events in ascending id order, never empty
    pub events: Vec<EventRecord>,
    /// Cursor position before this batch
    pub previous_last_id: EventId,
}

impl EventBatch {
    pub fn first_id(&self) -> EventId {
        self.events.first().map_or(self.previous_last_id, |e| e.id)
    }

    pub fn last_id(&self) -> EventId {
        self.events.last().map_or(self.previous_last_id, |e| e.id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Seed the cursor position on the very first run.
///
/// Without a stored position the reader would treat the whole history as
/// new, so the position starts at the newest existing event, or at
/// `NO_EVENT` when the log is empty. An existing position is left alone.
pub async fn establish_baseline(source: &dyn EventSource, cursor: &dyn CursorStore) -> Result<EventId> {
    if let Some(position) = cursor.last_processed().await? {
        return Ok(position);
    }

    let baseline = source.max_id().await?.unwrap_or(NO_EVENT);
    cursor.save_processed(baseline).await?;
    tracing::info!(last_processed_id = baseline, "Initialized cursor position");
    Ok(baseline)
}

/// Pull-based reader over the event log.
///
/// A reader is good for one work cycle; build a new one to restart from
/// the persisted position.
pub struct EventLogReader {
    source: Arc<dyn EventSource>,
    cursor: Arc<dyn CursorStore>,
    batch_size: usize,
    /// Position the next batch starts after
    position: EventId,
    /// Set once the lease is lost or the log is drained
    finished: bool,
}

impl EventLogReader {
    /// Read the persisted position and start a reader after it
    pub async fn new(
        source: Arc<dyn EventSource>,
        cursor: Arc<dyn CursorStore>,
        batch_size: usize,
    ) -> Result<Self> {
        let position = cursor.last_processed().await?.unwrap_or(NO_EVENT);
        Ok(Self {
            source,
            cursor,
            batch_size: batch_size.max(1),
            position,
            finished: false,
        })
    }

    /// Position the next batch starts after
    pub fn position(&self) -> EventId {
        self.position
    }

    /// Whether the reader stopped handing out batches
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next batch, or `None` when the log is drained or the lease was lost.
    ///
    /// Asking again before `mark_processed` returns the same batch.
    pub async fn next_batch(&mut self) -> Result<Option<EventBatch>> {
        if self.finished {
            return Ok(None);
        }

        let events = self.source.events_after(self.position, self.batch_size).await?;
        if events.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        Ok(Some(EventBatch {
            events,
            previous_last_id: self.position,
        }))
    }

    /// Persist the batch boundary and renew the lease.
    ///
    /// Returns `false` when the lease could not be renewed; the reader then
    /// hands out no further batches.
    pub async fn mark_processed(&mut self, batch: &EventBatch, lease: &Lease) -> Result<bool> {
        let last_id = batch.last_id();
        self.cursor.save_processed(last_id).await?;
        self.position = last_id;

        if lease.renew().await?.is_none() {
            tracing::warn!(
                last_processed_id = last_id,
                "Lease lost while reading the event log, stopping until it is re-acquired"
            );
            self.finished = true;
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{LockStore, MemoryStore};
    use crate::state::lease::{DEFAULT_LEASE_KEY, DEFAULT_LEASE_TTL};
    use crate::event::MemoryEventSource;
    use serde_json::json;

    fn events(ids: &[EventId]) -> Vec<EventRecord> {
        ids.iter()
            .map(|id| EventRecord::new(*id, "repository_updated", json!({})))
            .collect()
    }

    async fn owned_lease(store: &Arc<MemoryStore>) -> Lease {
        let lease = Lease::new(store.clone() as Arc<dyn LockStore>, DEFAULT_LEASE_KEY, DEFAULT_LEASE_TTL);
        assert!(lease.try_acquire().await.unwrap().owned);
        lease
    }

    #[tokio::test]
    async fn test_baseline_on_empty_log() {
        let source = MemoryEventSource::new();
        let store = MemoryStore::new();

        assert_eq!(establish_baseline(&source, &store).await.unwrap(), NO_EVENT);
        assert_eq!(store.last_processed().await.unwrap(), Some(NO_EVENT));
    }

    #[tokio::test]
    async fn test_baseline_skips_history() {
        let source = MemoryEventSource::with_events(events(&[1, 2, 3]));
        let store = MemoryStore::new();

        assert_eq!(establish_baseline(&source, &store).await.unwrap(), 3);

        // Later runs keep the stored position
        source.publish(EventRecord::new(4, "repository_updated", json!({}))).await;
        assert_eq!(establish_baseline(&source, &store).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_batches_are_chained() {
        let source = Arc::new(MemoryEventSource::with_events(events(&[1, 2, 3, 4, 5])));
        let store = Arc::new(MemoryStore::new());
        store.save_processed(NO_EVENT).await.unwrap();
        let lease = owned_lease(&store).await;

        let mut reader = EventLogReader::new(source, store.clone(), 2).await.unwrap();
        let mut seen = Vec::new();
        let mut previous_last = Vec::new();
        while let Some(batch) = reader.next_batch().await.unwrap() {
            previous_last.push(batch.previous_last_id);
            seen.extend(batch.events.iter().map(|e| e.id));
            assert!(reader.mark_processed(&batch, &lease).await.unwrap());
        }

        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(previous_last, vec![NO_EVENT, 2, 4]);
        assert_eq!(store.last_processed().await.unwrap(), Some(5));
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn test_unconfirmed_batch_is_redelivered() {
        let source = Arc::new(MemoryEventSource::with_events(events(&[1, 2, 3])));
        let store = Arc::new(MemoryStore::new());
        store.save_processed(NO_EVENT).await.unwrap();
        let lease = owned_lease(&store).await;

        let mut reader = EventLogReader::new(source.clone(), store.clone(), 2).await.unwrap();
        let first = reader.next_batch().await.unwrap().unwrap();
        assert!(reader.mark_processed(&first, &lease).await.unwrap());
        // Second batch is read but the process dies before confirming it
        let lost = reader.next_batch().await.unwrap().unwrap();
        assert_eq!(lost.first_id(), 3);
        drop(reader);

        let mut restarted = EventLogReader::new(source, store.clone(), 2).await.unwrap();
        assert_eq!(restarted.position(), 2);
        let replay = restarted.next_batch().await.unwrap().unwrap();
        assert_eq!(replay.first_id(), 3);
    }

    #[tokio::test]
    async fn test_lease_loss_stops_reading() {
        let source = Arc::new(MemoryEventSource::with_events(events(&[1, 2, 3, 4])));
        let store = Arc::new(MemoryStore::new());
        store.save_processed(NO_EVENT).await.unwrap();
        let lease = owned_lease(&store).await;

        let mut reader = EventLogReader::new(source, store.clone(), 2).await.unwrap();
        let batch = reader.next_batch().await.unwrap().unwrap();

        store.expire(DEFAULT_LEASE_KEY).await;
        assert!(!reader.mark_processed(&batch, &lease).await.unwrap());

        // Position still reflects the finished batch
        assert_eq!(store.last_processed().await.unwrap(), Some(2));
        assert!(reader.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hole_is_not_waited_for() {
        // 4 is not visible yet; the reader moves past it and gap tracking
        // picks it up
        let source = Arc::new(MemoryEventSource::with_events(events(&[3, 5])));
        let store = Arc::new(MemoryStore::new());
        store.save_processed(2).await.unwrap();

        let mut reader = EventLogReader::new(source, store, BATCH_SIZE).await.unwrap();
        let batch = reader.next_batch().await.unwrap().unwrap();
        let ids: Vec<_> = batch.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 5]);
        assert_eq!(batch.previous_last_id, 2);
    }
}
