//! Wire seam between the connection manager and a WebSocket implementation.
//!
//! The manager only sees text frames and close events. The production
//! connector speaks WebSocket through `tokio-tungstenite`; tests plug in
//! scripted in-memory transports.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, trace};
use url::Url;

use crate::error::ConnectionError;

/// Close code of an orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the stream ends without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Something the peer did to the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Frame(String),
    /// The channel is gone. `code` is `None` when no close frame arrived.
    Closed { code: Option<u16>, reason: String },
}

impl TransportEvent {
    pub fn closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Closed {
            code,
            reason: reason.into(),
        }
    }

    /// Whether this is an orderly close (code 1000).
    pub fn is_normal_close(&self) -> bool {
        matches!(
            self,
            Self::Closed {
                code: Some(NORMAL_CLOSURE),
                ..
            }
        )
    }
}

/// An open bidirectional text channel.
#[async_trait]
pub trait Transport: Send {
    /// Write one text frame.
    async fn send(&mut self, frame: String) -> Result<(), ConnectionError>;

    /// Wait for the next event. `None` once the channel is finished.
    async fn recv(&mut self) -> Option<TransportEvent>;

    /// Close the channel with `code`.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ConnectionError>;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, ConnectionError> {
        let (stream, response) = connect_async(url.as_str()).await?;
        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(TungsteniteTransport { stream }))
    }
}

struct TungsteniteTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&mut self, frame: String) -> Result<(), ConnectionError> {
        self.stream.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    return Some(TransportEvent::closed(None, err.to_string()));
                }
                None => return None,
            };

            match message {
                Message::Text(text) => return Some(TransportEvent::Frame(text.to_string())),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(TransportEvent::Frame(text)),
                    Err(_) => trace!(len = data.len(), "Skipping non-UTF-8 binary frame"),
                },
                Message::Ping(payload) => {
                    if let Err(err) = self.stream.send(Message::Pong(payload)).await {
                        return Some(TransportEvent::closed(None, err.to_string()));
                    }
                }
                Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(frame) => {
                    let event = match frame {
                        Some(frame) => {
                            TransportEvent::closed(Some(frame.code.into()), frame.reason.to_string())
                        }
                        None => TransportEvent::closed(None, "closed without status"),
                    };
                    return Some(event);
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ConnectionError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.stream.close(Some(frame)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_close_detection() {
        assert!(TransportEvent::closed(Some(1000), "bye").is_normal_close());
        assert!(!TransportEvent::closed(Some(1006), "").is_normal_close());
        assert!(!TransportEvent::closed(None, "").is_normal_close());
        assert!(!TransportEvent::Frame("{}".into()).is_normal_close());
    }

    #[tokio::test]
    async fn test_connect_refused_is_websocket_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let result = TungsteniteConnector.connect(&url).await;
        assert!(matches!(result, Err(ConnectionError::WebSocket { .. })));
    }
}
