//! Geo Log Cursor Error Types

use thiserror::Error;

use crate::event::EventId;

/// Result type alias for cursor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Geo log cursor error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Event source errors
    #[error("Event source error: {0}")]
    EventSource(#[from] sqlx::Error),

    // Cursor, gap and lease storage errors
    #[error("State error: {0}")]
    State(String),

    // Dispatch errors
    #[error("No handler registered for event type '{0}'")]
    UnknownEventType(String),

    #[error("Handler failed for event {event_id}: {message}")]
    Handler { event_id: EventId, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a transient infrastructure failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::EventSource(_) | Error::State(_) | Error::Http(_) | Error::Io(_)
        )
    }

    /// Check if this error will fail again no matter how often it is retried
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Error::UnknownEventType(_) | Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_event_type_is_not_retryable() {
        let err = Error::UnknownEventType("Foo".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_programmer_error());
        assert!(err.to_string().contains("'Foo'"));
    }

    #[test]
    fn test_state_error_is_retryable() {
        let err = Error::State("database is locked".to_string());
        assert!(err.is_retryable());
        assert!(!err.is_programmer_error());
    }

    #[test]
    fn test_handler_error_formatting() {
        let err = Error::Handler {
            event_id: 42,
            message: "repository not found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("repository not found"));
        assert!(!err.is_retryable());
    }
}
