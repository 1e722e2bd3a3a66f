//! Real-time channel configuration.

use std::time::Duration;

use url::Url;

use crate::{error::ConnectionError, retry::Backoff};

/// How long to wait between automatic reconnect attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReconnectStrategy {
    /// The same delay before every attempt.
    Fixed(Duration),
    /// Exponential growth with a cap and jitter.
    Exponential(Backoff),
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::Fixed(Duration::from_millis(3000))
    }
}

impl ReconnectStrategy {
    /// Delay before reconnect attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential(backoff) => backoff.delay_for_attempt(attempt),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Fixed(delay) if delay.is_zero() => {
                Err("Reconnect interval must be > 0".to_string())
            }
            Self::Fixed(_) => Ok(()),
            Self::Exponential(backoff) => backoff.validate(),
        }
    }
}

/// Configuration for a [`ConnectionManager`](super::ConnectionManager).
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Channel endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Query parameter carrying the per-connection session credential.
    pub credential_param: String,

    // Reconnection
    pub reconnect: ReconnectStrategy,
    /// Automatic attempts before giving up with an error status.
    pub max_reconnect_attempts: u32,

    // Heartbeat
    /// Interval between application-level pings.
    pub heartbeat_interval: Duration,
    /// Treat the link as lost when no pong follows a ping within this time.
    pub pong_timeout: Option<Duration>,

    /// Timeout for opening the channel.
    pub connect_timeout: Duration,
    /// Recently seen inbound message ids to suppress as duplicates
    /// (0 disables suppression).
    pub dedup_window: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            credential_param: "token".to_string(),
            reconnect: ReconnectStrategy::default(),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: None,
            connect_timeout: Duration::from_secs(10),
            dedup_window: 0,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for `url` with default settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn credential_param(mut self, name: impl Into<String>) -> Self {
        self.credential_param = name.into();
        self
    }

    /// Use a fixed delay between reconnect attempts.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect = ReconnectStrategy::Fixed(interval);
        self
    }

    /// Use capped exponential delays with jitter between reconnect attempts.
    #[must_use]
    pub fn reconnect_exponential(mut self, backoff: Backoff) -> Self {
        self.reconnect = ReconnectStrategy::Exponential(backoff);
        self
    }

    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn pong_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pong_timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        let url = Url::parse(&self.url).map_err(|e| format!("Invalid URL: {e}"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!("Unsupported URL scheme '{}'", url.scheme()));
        }
        if self.credential_param.is_empty() {
            return Err("Credential parameter name cannot be empty".to_string());
        }
        self.reconnect.validate()?;
        if self.heartbeat_interval.is_zero() {
            return Err("Heartbeat interval must be > 0".to_string());
        }
        if self.pong_timeout.is_some_and(|t| t.is_zero()) {
            return Err("Pong timeout must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        Ok(())
    }

    /// Endpoint URL with `credential` appended as the credential parameter.
    pub fn session_url(&self, credential: &str) -> Result<Url, ConnectionError> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut()
            .append_pair(&self.credential_param, credential);
        Ok(url)
    }
}
