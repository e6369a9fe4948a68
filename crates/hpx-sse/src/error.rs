//! Error handling for SSE sessions, transports and subscriptions.

use thiserror::Error;

/// The main result type used throughout the crate.
pub type SseResult<T> = Result<T, SseError>;

/// Error type for all SSE operations.
#[derive(Error, Debug)]
pub enum SseError {
    /// Payload serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors from the client transport
    #[cfg(feature = "http-client")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered the stream request with a non-2xx status
    #[error("Invalid SSE status: {status}")]
    InvalidStatus { status: http::StatusCode },

    /// The server answered with something other than `text/event-stream`
    #[error("Invalid SSE content type: {content_type}")]
    InvalidContentType { content_type: String },

    /// The server closed the stream
    #[error("SSE stream ended")]
    StreamEnded,

    /// Malformed bytes on the wire
    #[error("SSE parse error: {message}")]
    Parse { message: String },

    /// Event names must fit on a single `event:` line
    #[error("Invalid event name: {name:?}")]
    InvalidEventName { name: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A session was used before its outgoing channel existed
    #[error("Session not started: cannot {operation} before the stream is opened")]
    SessionNotStarted { operation: &'static str },

    /// A stream handler failed
    #[error("Handler error: {message}")]
    Handler { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SseError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create an invalid status error.
    pub fn invalid_status(status: http::StatusCode) -> Self {
        Self::InvalidStatus { status }
    }

    /// Create an invalid content type error.
    pub fn invalid_content_type(content_type: impl Into<String>) -> Self {
        Self::InvalidContentType {
            content_type: content_type.into(),
        }
    }

    /// Create an invalid event name error.
    pub fn invalid_event_name(name: impl Into<String>) -> Self {
        Self::InvalidEventName { name: name.into() }
    }

    pub(crate) fn not_started(operation: &'static str) -> Self {
        Self::SessionNotStarted { operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SseError::config("URL cannot be empty");
        assert!(matches!(err, SseError::Config { .. }));

        let err = SseError::invalid_status(http::StatusCode::FORBIDDEN);
        assert!(matches!(err, SseError::InvalidStatus { .. }));

        let err = SseError::not_started("send");
        assert_eq!(
            err.to_string(),
            "Session not started: cannot send before the stream is opened"
        );
    }
}
