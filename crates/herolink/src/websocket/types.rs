//! Core type definitions for the real-time channel.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RouterError;

/// Outbound heartbeat type.
pub const PING_TYPE: &str = "ping";
/// Inbound heartbeat reply type.
pub const PONG_TYPE: &str = "pong";
/// Route selector that receives every dispatched message.
pub const WILDCARD: &str = "*";

/// Unique message identifier for correlation.
/// Uses ULID for lexicographically sortable, unique IDs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new unique message ID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Application message type used for routing.
///
/// Never empty, never the wildcard selector, and never one of the reserved
/// heartbeat types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(String);

impl MessageType {
    /// Validate `s` as an application message type.
    pub fn new(s: impl Into<String>) -> Result<Self, RouterError> {
        let s = s.into();
        let reason = if s.trim().is_empty() {
            Some("message type cannot be empty")
        } else if s == WILDCARD {
            Some("'*' selects the wildcard route")
        } else if is_heartbeat(&s) {
            Some("reserved for the heartbeat")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(RouterError::InvalidType {
                message_type: s,
                reason,
            }),
            None => Ok(Self(s)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for MessageType {
    type Error = RouterError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

pub(crate) fn is_heartbeat(message_type: &str) -> bool {
    message_type == PING_TYPE || message_type == PONG_TYPE
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// A message on the wire, in either direction.
///
/// ```json
/// {"type": "chat", "payload": {"text": "gg"}, "timestamp": 1700000000000, "id": "01H..."}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
}

impl ChannelMessage {
    /// Create an unstamped message; `send` fills in the timestamp and id.
    pub fn new(message_type: &MessageType, payload: Option<Value>) -> Self {
        Self::raw(message_type.as_str(), payload)
    }

    pub(crate) fn raw(message_type: &str, payload: Option<Value>) -> Self {
        Self {
            message_type: message_type.to_string(),
            payload,
            timestamp: None,
            id: None,
        }
    }

    /// Application-level heartbeat.
    pub(crate) fn ping() -> Self {
        Self::raw(PING_TYPE, None).stamped()
    }

    pub(crate) fn pong() -> Self {
        Self::raw(PONG_TYPE, None).stamped()
    }

    /// Fill in a missing timestamp and id.
    #[must_use]
    pub fn stamped(mut self) -> Self {
        self.timestamp.get_or_insert_with(now_millis);
        self.id.get_or_insert_with(MessageId::new);
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        is_heartbeat(&self.message_type)
    }
}

/// Connection state of the real-time channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// Returns true if the channel is usable for sending.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns true if a `connect()` call is needed to get going again.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}
