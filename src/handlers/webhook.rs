//! Webhook Handler
//!
//! Forwards an event as JSON to an HTTP endpoint that performs the actual
//! replication work. Any non-success status fails the event.

use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{EventHandler, HandlerRegistry};
use crate::config::HandlerConfig;
use crate::event::{EventId, EventRecord};
use crate::logging::CursorLogger;
use crate::error::{Error, Result};

/// Request body sent to the endpoint
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    id: EventId,
    event_type: &'a str,
    payload: &'a Option<serde_json::Value>,
    resource_id: Option<i64>,
    created_at: DateTime<Utc>,
}

/// Handler posting one event to a URL
pub struct WebhookHandler {
    client: reqwest::Client,
    url: String,
    event: EventRecord,
    created_at: DateTime<Utc>,
    logger: CursorLogger,
}

impl WebhookHandler {
    pub fn new(
        client: reqwest::Client,
        url: String,
        event: EventRecord,
        created_at: DateTime<Utc>,
        logger: CursorLogger,
    ) -> Self {
        Self {
            client,
            url,
            event,
            created_at,
            logger,
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for WebhookHandler {
    async fn process(&mut self) -> Result<()> {
        let body = WebhookBody {
            id: self.event.id,
            event_type: &self.event.event_type,
            payload: &self.event.payload,
            resource_id: self.event.resource_id,
            created_at: self.created_at,
        };

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Handler {
                event_id: self.event.id,
                message: format!("{} responded with {}", self.url, status),
            });
        }

        self.logger.event_info(self.created_at, "Event delivered to webhook");
        Ok(())
    }
}

/// Register a webhook handler for every configured event type
pub fn register_webhooks(registry: &mut HandlerRegistry, handlers: &[HandlerConfig]) -> Result<()> {
    for handler in handlers {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(handler.timeout_secs))
            .build()?;
        let url = handler.url.clone();

        registry.register(handler.event_type.clone(), move |event, created_at, logger| {
            Box::new(WebhookHandler::new(client.clone(), url.clone(), event, created_at, logger))
        });
        tracing::debug!("Registered webhook for {} -> {}", handler.event_type, handler.url);
    }
    Ok(())
}
