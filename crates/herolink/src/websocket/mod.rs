//! Real-time channel client.
//!
//! - **Lifecycle**: connect, disconnect and a five-state status machine with
//!   listeners
//! - **Reconnection**: bounded attempts with a fixed delay, or opt-in
//!   exponential backoff with jitter
//! - **Heartbeat**: application-level `ping` every interval, `pong` consumed
//! - **Queueing**: messages sent while disconnected are held and flushed in
//!   order on the next connect
//! - **Routing**: type-keyed listeners plus a `"*"` wildcard
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐  spawn   ┌──────────────────┐      ┌──────────┐
//! │ ConnectionManager │────────▶│ connection task  │◀────▶│  Server  │
//! │      (Clone)      │          │ (one per epoch)  │      └──────────┘
//! └─────────┬─────────┘          └────────┬─────────┘
//!           │ send()                      │ dispatch / flush
//!           ▼                             ▼
//!        ┌──────────────────────────────────────┐
//!        │ MessageRouter: listeners + out queue │
//!        └──────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use herolink::websocket::{ChannelMessage, ConnectionConfig, ConnectionManager, MessageType};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::new(ConnectionConfig::new("wss://game.example/ws"))?;
//! let _chat = manager.on("chat", |message| println!("{:?}", message.payload))?;
//!
//! manager.connect().await?;
//! let hello = MessageType::new("chat")?;
//! manager.send(ChannelMessage::new(&hello, Some(serde_json::json!({"text": "hi"}))));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod router;
pub mod transport;
pub mod types;

pub use config::{ConnectionConfig, ReconnectStrategy};
pub use manager::ConnectionManager;
pub use router::{Dispatch, MessageRouter};
pub use transport::{
    ABNORMAL_CLOSURE, Connector, NORMAL_CLOSURE, Transport, TransportEvent, TungsteniteConnector,
};
pub use types::{
    ChannelMessage, ConnectionState, MessageId, MessageType, PING_TYPE, PONG_TYPE, WILDCARD,
};
