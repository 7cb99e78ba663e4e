//! Event Handlers
//!
//! The registry maps an event type tag to a factory building the handler
//! for one event. It is filled once at startup; looking up an unknown tag
//! is a configuration error, not a data problem.

pub mod webhook;

pub use webhook::WebhookHandler;

use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};

use crate::event::EventRecord;
use crate::logging::CursorLogger;
use crate::error::{Error, Result};

/// Processes a single replication event
#[async_trait::async_trait]
pub trait EventHandler: Send {
    async fn process(&mut self) -> Result<()>;
}

/// Builds a handler for one event
pub type HandlerFactory =
    Arc<dyn Fn(EventRecord, DateTime<Utc>, CursorLogger) -> Box<dyn EventHandler> + Send + Sync>;

/// Event type -> handler factory
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `event_type`, replacing any previous one
    pub fn register<F>(&mut self, event_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(EventRecord, DateTime<Utc>, CursorLogger) -> Box<dyn EventHandler> + Send + Sync + 'static,
    {
        self.factories.insert(event_type.into(), Arc::new(factory));
        self
    }

    /// Factory for `event_type`
    pub fn resolve(&self, event_type: &str) -> Result<&HandlerFactory> {
        self.factories
            .get(event_type)
            .ok_or_else(|| Error::UnknownEventType(event_type.to_string()))
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
