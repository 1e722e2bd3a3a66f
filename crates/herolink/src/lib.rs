//! # herolink
//!
//! Resilient client-side communication layer for a game client.
//!
//! - [`call`]: keyed call orchestration with status tracking, in-flight
//!   deduplication, retry with exponential backoff, cancellation and
//!   cache-aware refresh
//! - [`websocket`]: one persistent real-time channel with reconnection,
//!   heartbeat, an outbound queue and type-keyed dispatch
//! - [`cache`]: the TTL store calls memoize through
//! - [`settings`]: the persisted settings blob
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use herolink::{CallError, CallKey, CallOptions, CallRegistry};
//!
//! # async fn run() -> Result<(), CallError> {
//! let registry: CallRegistry<Vec<String>> = CallRegistry::new();
//! let key = CallKey::new("heroes")?;
//!
//! let _watch = registry.subscribe(&key, |state| println!("{:?}", state.status));
//! let heroes = registry
//!     .execute(&key, || async { Ok(vec!["Aria".to_string()]) }, CallOptions::new())
//!     .await?;
//! # let _ = heroes;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod call;
pub mod error;
pub mod listeners;
pub mod retry;
pub mod settings;
pub mod websocket;

pub use cache::{CacheEntry, CacheStore};
pub use call::{CallKey, CallOptions, CallRegistry, CallState, CallStatus};
pub use error::{
    CallError, CallResult, ConnectionError, ConnectionResult, RouterError, SettingsError,
};
pub use listeners::Subscription;
pub use retry::{Backoff, RetryError, RetryExecutor, RetryPolicy};
pub use settings::{Settings, SettingsStore};
pub use websocket::{ChannelMessage, ConnectionConfig, ConnectionManager, ConnectionState};
