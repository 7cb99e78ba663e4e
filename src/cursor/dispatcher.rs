//! Event Dispatcher
//!
//! Routes one event to its handler. Missing payloads and resources this
//! node does not replicate are expected and count as handled; an event
//! type without a handler is a configuration error and fails the cycle.
//!
//! | Condition | Outcome |
//! |---|---|
//! | payload missing | warn, `SkippedMissingPayload` |
//! | resource not selected, still exists | info, `SkippedIrrelevant` |
//! | resource not selected, deleted | processed |
//! | no handler registered | error, `Err(UnknownEventType)` |
//! | handler fails | `Err` from the handler |

use std::sync::Arc;
use tracing::Instrument;

use crate::event::EventRecord;
use crate::handlers::HandlerRegistry;
use crate::logging::CursorLogger;
use crate::node::ResourcePolicy;
use crate::error::Result;

/// What happened to a dispatched event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler ran successfully
    Processed,
    /// The event's payload is gone; consumed without processing
    SkippedMissingPayload,
    /// The event belongs to a resource this node does not replicate
    SkippedIrrelevant,
}

/// Routes events to handlers from the registry
pub struct EventDispatcher {
    registry: HandlerRegistry,
    resources: Arc<dyn ResourcePolicy>,
    logger: CursorLogger,
}

impl EventDispatcher {
    pub fn new(registry: HandlerRegistry, resources: Arc<dyn ResourcePolicy>, logger: CursorLogger) -> Self {
        Self {
            registry,
            resources,
            logger,
        }
    }

    /// Handle a single event
    pub async fn handle_single_event(&self, event: &EventRecord) -> Result<Disposition> {
        let span = self.logger.event_span(event);
        self.dispatch(event).instrument(span).await
    }

    async fn dispatch(&self, event: &EventRecord) -> Result<Disposition> {
        if event.payload.is_none() {
            // The subject was hard-deleted and took the payload with it
            self.logger
                .event_warn(event.created_at, "Event payload not found, skipping event");
            return Ok(Disposition::SkippedMissingPayload);
        }

        if !self.replayable(event).await? {
            self.logger.event_info(event.created_at, "Event skipped");
            return Ok(Disposition::SkippedIrrelevant);
        }

        let factory = match self.registry.resolve(&event.event_type) {
            Ok(factory) => factory,
            Err(e) => {
                self.logger
                    .event_error(event.created_at, &format!("Unable to process event: {}", e));
                return Err(e);
            }
        };

        let mut handler = factory(event.clone(), event.created_at, self.logger.clone());
        handler.process().await?;
        Ok(Disposition::Processed)
    }

    /// Global events and events of deleted resources are always replayed;
    /// the latter so their cleanup reaches this node.
    async fn replayable(&self, event: &EventRecord) -> Result<bool> {
        let Some(resource_id) = event.resource_id else {
            return Ok(true);
        };

        if !self.resources.resource_exists(resource_id).await? {
            return Ok(true);
        }

        self.resources.resource_relevant(resource_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::EventHandler;
    use crate::node::StaticResourcePolicy;
    use crate::Error;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recording {
        id: i64,
        seen: Arc<Mutex<Vec<i64>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl EventHandler for Recording {
        async fn process(&mut self) -> Result<()> {
            if self.fail {
                return Err(Error::Handler {
                    event_id: self.id,
                    message: "boom".into(),
                });
            }
            self.seen.lock().unwrap().push(self.id);
            Ok(())
        }
    }

    fn dispatcher(policy: StaticResourcePolicy, seen: &Arc<Mutex<Vec<i64>>>) -> EventDispatcher {
        let mut registry = HandlerRegistry::new();
        let ok_seen = seen.clone();
        registry.register("repository_updated", move |event, _, _| {
            Box::new(Recording {
                id: event.id,
                seen: ok_seen.clone(),
                fail: false,
            })
        });
        let failing_seen = seen.clone();
        registry.register("broken", move |event, _, _| {
            Box::new(Recording {
                id: event.id,
                seen: failing_seen.clone(),
                fail: true,
            })
        });
        EventDispatcher::new(registry, Arc::new(policy), CursorLogger::new())
    }

    #[tokio::test]
    async fn test_processes_registered_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(StaticResourcePolicy::all([1]), &seen);

        let event = EventRecord::new(7, "repository_updated", json!({})).with_resource(1);
        assert_eq!(dispatcher.handle_single_event(&event).await.unwrap(), Disposition::Processed);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_missing_payload_is_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(StaticResourcePolicy::all([1]), &seen);

        let event = EventRecord::new(7, "Foo", json!({})).without_payload();
        assert_eq!(
            dispatcher.handle_single_event(&event).await.unwrap(),
            Disposition::SkippedMissingPayload
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_irrelevant_resource_is_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(StaticResourcePolicy::selective([1, 2], [2]), &seen);

        let event = EventRecord::new(7, "repository_updated", json!({})).with_resource(1);
        assert_eq!(
            dispatcher.handle_single_event(&event).await.unwrap(),
            Disposition::SkippedIrrelevant
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_resource_is_always_replayed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        // Resource 1 is not selected and no longer exists
        let dispatcher = dispatcher(StaticResourcePolicy::selective([2], [2]), &seen);

        let event = EventRecord::new(8, "repository_updated", json!({})).with_resource(1);
        assert_eq!(dispatcher.handle_single_event(&event).await.unwrap(), Disposition::Processed);
        assert_eq!(*seen.lock().unwrap(), vec![8]);
    }

    #[tokio::test]
    async fn test_global_event_is_replayed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(StaticResourcePolicy::selective([], []), &seen);

        let event = EventRecord::new(9, "repository_updated", json!({}));
        assert_eq!(dispatcher.handle_single_event(&event).await.unwrap(), Disposition::Processed);
    }

    #[tokio::test]
    async fn test_unknown_type_fails() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(StaticResourcePolicy::all([1]), &seen);

        let event = EventRecord::new(10, "Foo", json!({}));
        match dispatcher.handle_single_event(&event).await {
            Err(Error::UnknownEventType(t)) => assert_eq!(t, "Foo"),
            other => panic!("expected unknown event type, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_propagates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(StaticResourcePolicy::all([1]), &seen);

        let event = EventRecord::new(11, "broken", json!({}));
        assert!(matches!(
            dispatcher.handle_single_event(&event).await,
            Err(Error::Handler { event_id: 11, .. })
        ));
    }
}
