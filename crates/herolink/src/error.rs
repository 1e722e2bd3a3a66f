//! Error types for calls, the real-time channel and persisted settings.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Fallback text when an error carries nothing presentable.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error occurred";

/// Result type for orchestrated calls.
pub type CallResult<T> = Result<T, CallError>;

/// Result type for channel operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Failure of a unit of remote work driven by the call registry.
#[derive(Error, Debug)]
pub enum CallError {
    /// The request produced no response at all.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The server answered with a 5xx status.
    #[error("Server error: status={status}, body={body}")]
    Server { status: u16, body: String },

    /// The server rejected the request with a 4xx status.
    #[error("Client error: status={status}, body={body}")]
    Client { status: u16, body: String },

    /// The execution was cancelled or superseded by `cancel`/`reset`.
    #[error("Request cancelled")]
    Cancelled,

    /// Another execution for the same key is still loading.
    #[error("Call already in progress for key '{key}'")]
    InProgress { key: String },

    /// Every permitted attempt failed with a retryable error.
    #[error("{source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<CallError>,
    },

    /// A call key failed validation.
    #[error("Invalid call key: {message}")]
    InvalidKey { message: String },

    /// Anything else raised by the work function.
    #[error("{message}")]
    Other { message: String },
}

impl CallError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an error from an arbitrary message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Classify a response status into a server or client error.
    ///
    /// Statuses below 400 are not failures; they are mapped to
    /// [`CallError::Other`] so that a misbehaving work function still yields
    /// a terminal, non-retryable error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            500.. => Self::Server { status, body },
            400..=499 => Self::Client { status, body },
            _ => Self::Other {
                message: format!("Unexpected status {status}: {body}"),
            },
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Server { .. })
    }

    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// HTTP-like status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            Self::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Human-readable message for display next to a failed call.
    ///
    /// Prefers the server's structured `message` field, then a generic
    /// `error` field, then the error's own text.
    pub fn display_message(&self) -> String {
        match self {
            Self::Server { body, .. } | Self::Client { body, .. } => body_message(body)
                .or_else(|| non_empty(body))
                .unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string()),
            Self::RetriesExhausted { source, .. } => source.display_message(),
            Self::Network { message } | Self::Other { message } => {
                non_empty(message).unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string())
            }
            other => other.to_string(),
        }
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Extract `message`, then `error`, from a JSON response body.
fn body_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "error"].iter().find_map(|field| match value.get(field)? {
        Value::String(text) => non_empty(text),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

/// Failure of the real-time channel.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Transport-level failure while opening, reading or writing.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// Invalid configuration or URL.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Opening the channel did not finish in time.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The peer closed the channel.
    #[error("Connection closed: code={code:?}, reason={reason}")]
    ConnectionClosed { code: Option<u16>, reason: String },

    /// A `connect()` is already opening the channel.
    #[error("Connection attempt already in progress")]
    ConnectInProgress,

    /// Automatic reconnection gave up.
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The attempt was abandoned by `disconnect()`.
    #[error("Connection attempt aborted")]
    Aborted,

    /// Serialization of an outbound message failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConnectionError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a close error.
    pub fn closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::websocket(e.to_string())
    }
}

impl From<url::ParseError> for ConnectionError {
    fn from(e: url::ParseError) -> Self {
        Self::config(format!("Invalid URL: {e}"))
    }
}

/// Rejected listener registration on the message router.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Invalid message type '{message_type}': {reason}")]
    InvalidType {
        message_type: String,
        reason: &'static str,
    },
}

/// Failure to read or write the persisted settings blob.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            CallError::from_status(503, ""),
            CallError::Server { status: 503, .. }
        ));
        assert!(matches!(
            CallError::from_status(404, ""),
            CallError::Client { status: 404, .. }
        ));
        assert!(matches!(
            CallError::from_status(302, ""),
            CallError::Other { .. }
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(CallError::network("offline").is_retryable());
        assert!(CallError::from_status(500, "").is_retryable());
        assert!(!CallError::from_status(400, "").is_retryable());
        assert!(!CallError::Cancelled.is_retryable());
        assert!(!CallError::other("boom").is_retryable());
    }

    #[test]
    fn test_display_message_prefers_server_message() {
        let err = CallError::from_status(500, r#"{"message":"maintenance","error":"x"}"#);
        assert_eq!(err.display_message(), "maintenance");

        let err = CallError::from_status(400, r#"{"error":"bad hero id"}"#);
        assert_eq!(err.display_message(), "bad hero id");
    }

    #[test]
    fn test_display_message_fallbacks() {
        let err = CallError::from_status(502, "Bad Gateway");
        assert_eq!(err.display_message(), "Bad Gateway");

        let err = CallError::from_status(502, "");
        assert_eq!(err.display_message(), UNKNOWN_ERROR_MESSAGE);

        let err = CallError::network("");
        assert_eq!(err.display_message(), UNKNOWN_ERROR_MESSAGE);

        assert_eq!(CallError::Cancelled.display_message(), "Request cancelled");
    }

    #[test]
    fn test_exhausted_uses_last_error() {
        let err = CallError::RetriesExhausted {
            attempts: 4,
            source: Box::new(CallError::from_status(500, r#"{"message":"down"}"#)),
        };
        assert_eq!(err.display_message(), "down");
        assert_eq!(err.status(), Some(500));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_connection_error_creation() {
        let err = ConnectionError::config("Invalid URL");
        assert!(matches!(err, ConnectionError::Config { .. }));

        let err = ConnectionError::timeout(Duration::from_secs(5));
        assert!(matches!(err, ConnectionError::Timeout { .. }));

        let err: ConnectionError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, ConnectionError::Config { .. }));
    }
}
