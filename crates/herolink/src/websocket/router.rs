//! Type-keyed fan-out of inbound messages and the outbound queue.
//!
//! Inbound frames are parsed and delivered synchronously: listeners for the
//! message's type first, in registration order, then wildcard listeners. A
//! malformed frame is logged and dropped without reaching any listener.
//! Outbound messages wait in a FIFO queue that the connection task drains
//! while connected.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::types::{ChannelMessage, MessageId, MessageType, PING_TYPE, PONG_TYPE, WILDCARD};
use crate::{
    error::RouterError,
    listeners::{ListenerMap, Subscription},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Route {
    Type(MessageType),
    Any,
}

impl Route {
    fn parse(selector: &str) -> Result<Self, RouterError> {
        if selector == WILDCARD {
            Ok(Self::Any)
        } else {
            MessageType::new(selector).map(Self::Type)
        }
    }
}

/// What happened to one inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to this many listeners (possibly zero).
    Delivered { listeners: usize },
    /// Server heartbeat request; never forwarded.
    Ping,
    /// Heartbeat reply; never forwarded.
    Pong,
    /// Already seen within the dedup window.
    Duplicate,
    /// Not a valid channel message.
    Malformed,
}

struct SeenIds {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

struct RouterInner {
    listeners: Arc<ListenerMap<Route, ChannelMessage>>,
    outbound: Mutex<VecDeque<ChannelMessage>>,
    seen: Mutex<SeenIds>,
    dedup_window: usize,
}

/// Publish/subscribe hub for channel messages.
///
/// Cloning is cheap; clones share listeners and the outbound queue.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MessageRouter {
    /// Create a router; `dedup_window > 0` suppresses repeated message ids
    /// among the last `dedup_window` delivered messages.
    pub fn new(dedup_window: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                listeners: ListenerMap::new(),
                outbound: Mutex::new(VecDeque::new()),
                seen: Mutex::new(SeenIds {
                    order: VecDeque::with_capacity(dedup_window),
                    ids: HashSet::with_capacity(dedup_window),
                }),
                dedup_window,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Listen for messages of `message_type`; `"*"` listens to everything.
    pub fn on<F>(&self, message_type: &str, callback: F) -> Result<Subscription, RouterError>
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        let route = Route::parse(message_type)?;
        Ok(self.inner.listeners.add(route, Arc::new(callback)))
    }

    /// Listen to every dispatched message.
    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Route::Any, Arc::new(callback))
    }

    /// Remove every listener for `message_type` (`"*"` for wildcard ones).
    ///
    /// Single listeners are removed through their [`Subscription`].
    pub fn off(&self, message_type: &str) -> usize {
        match Route::parse(message_type) {
            Ok(route) => self.inner.listeners.remove_all(&route),
            Err(_) => 0,
        }
    }

    /// Number of listeners for `message_type` (`"*"` for wildcard ones).
    pub fn listener_count(&self, message_type: &str) -> usize {
        Route::parse(message_type)
            .map(|route| self.inner.listeners.count(&route))
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Parse one inbound frame and deliver it.
    pub fn dispatch(&self, raw: &str) -> Dispatch {
        let message: ChannelMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Dropping malformed channel message");
                return Dispatch::Malformed;
            }
        };

        match message.message_type.as_str() {
            PING_TYPE => return Dispatch::Ping,
            PONG_TYPE => return Dispatch::Pong,
            _ => {}
        }

        let message_type = match MessageType::new(message.message_type.as_str()) {
            Ok(message_type) => message_type,
            Err(err) => {
                warn!(error = %err, "Dropping channel message with invalid type");
                return Dispatch::Malformed;
            }
        };

        if self.is_duplicate(&message) {
            debug!(message_type = %message_type, "Dropping duplicate channel message");
            return Dispatch::Duplicate;
        }

        let listeners = &self.inner.listeners;
        let delivered = listeners.emit(&Route::Type(message_type), &message)
            + listeners.emit(&Route::Any, &message);
        Dispatch::Delivered {
            listeners: delivered,
        }
    }

    fn is_duplicate(&self, message: &ChannelMessage) -> bool {
        let window = self.inner.dedup_window;
        let Some(id) = message.id.as_ref().filter(|_| window > 0) else {
            return false;
        };

        let mut seen = self.inner.seen.lock();
        if !seen.ids.insert(id.clone()) {
            return true;
        }
        seen.order.push_back(id.clone());
        while seen.order.len() > window {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        false
    }

    // ------------------------------------------------------------------------
    // Outbound queue
    // ------------------------------------------------------------------------

    /// Messages waiting to be written.
    pub fn queued_len(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    pub(crate) fn enqueue(&self, message: ChannelMessage) {
        self.inner.outbound.lock().push_back(message);
    }

    pub(crate) fn next_outbound(&self) -> Option<ChannelMessage> {
        self.inner.outbound.lock().pop_front()
    }

    /// Put back a message whose write failed, ahead of everything else.
    pub(crate) fn requeue_front(&self, message: ChannelMessage) {
        self.inner.outbound.lock().push_front(message);
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("queued", &self.queued_len())
            .field("dedup_window", &self.inner.dedup_window)
            .finish()
    }
}
