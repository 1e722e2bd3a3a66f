//! Lifecycle of the single real-time channel.
//!
//! `connect()` opens the transport and spawns one driver task per
//! connection epoch. The driver drains the outbound queue, dispatches
//! inbound frames to the router, sends heartbeats, and on an abnormal close
//! runs bounded reconnection before giving up with an error status.
//! `disconnect()` bumps the epoch and cancels the session token, so a
//! superseded driver can neither reconnect nor write state. Dropping the
//! last handle does the same.

use std::{fmt, future, sync::Arc};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::{
    sync::{Notify, oneshot},
    time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    config::ConnectionConfig,
    router::{Dispatch, MessageRouter},
    transport::{
        ABNORMAL_CLOSURE, Connector, NORMAL_CLOSURE, Transport, TransportEvent,
        TungsteniteConnector,
    },
    types::{ChannelMessage, ConnectionState},
};
use crate::{
    error::{ConnectionError, ConnectionResult, RouterError},
    listeners::{ListenerMap, Subscription},
};

/// Identifies one `connect()` lifetime, reconnects included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ConnectionEpoch(u64);

struct LinkState {
    status: ConnectionState,
    epoch: ConnectionEpoch,
    reconnect_attempts: u32,
    session: Option<CancellationToken>,
    last_error: Option<String>,
}

struct ManagerInner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    router: MessageRouter,
    link: Mutex<LinkState>,
    status_listeners: Arc<ListenerMap<(), ConnectionState>>,
    // Serializes mutate-then-notify for status listeners.
    notify: ReentrantMutex<()>,
    outbound_ready: Notify,
    flush: tokio::sync::Mutex<()>,
}

/// How one connected link ended.
enum LinkEnd {
    Shutdown,
    Normal,
    Lost(ConnectionError),
}

/// Client for one persistent bidirectional channel.
///
/// Cloning is cheap; clones control the same channel. Dropping the last
/// clone disconnects, like [`disconnect`](Self::disconnect).
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    // `None` on the driver's copy so the task never keeps the channel alive.
    lease: Option<Arc<HandleLease>>,
}

/// Shared by user-facing handles; the last drop shuts the channel down.
struct HandleLease {
    inner: Arc<ManagerInner>,
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        let manager = ConnectionManager {
            inner: Arc::clone(&self.inner),
            lease: None,
        };
        if manager.inner.link.lock().session.is_some() {
            debug!("Last handle dropped; disconnecting");
        }
        manager.disconnect();
    }
}

/// Undoes a `Connecting` transition when the `connect()` future is dropped
/// before the open attempt resolves.
struct ConnectGuard<'a> {
    manager: &'a ConnectionManager,
    epoch: ConnectionEpoch,
    armed: bool,
}

impl ConnectGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let epoch = self.epoch;
        let session = self.manager.update(|link| {
            if link.epoch != epoch || link.status != ConnectionState::Connecting {
                return None;
            }
            link.status = ConnectionState::Disconnected;
            link.session.take()
        });
        if let Some(session) = session {
            session.cancel();
            debug!(epoch = epoch.0, "Connect abandoned");
        }
    }
}

impl ConnectionManager {
    /// Create a manager speaking WebSocket via `tokio-tungstenite`.
    pub fn new(config: ConnectionConfig) -> ConnectionResult<Self> {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    /// Create a manager over a custom transport.
    pub fn with_connector(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> ConnectionResult<Self> {
        config.validate().map_err(ConnectionError::config)?;
        let router = MessageRouter::new(config.dedup_window);
        let inner = Arc::new(ManagerInner {
            config,
            connector,
            router,
            link: Mutex::new(LinkState {
                status: ConnectionState::Disconnected,
                epoch: ConnectionEpoch::default(),
                reconnect_attempts: 0,
                session: None,
                last_error: None,
            }),
            status_listeners: ListenerMap::new(),
            notify: ReentrantMutex::new(()),
            outbound_ready: Notify::new(),
            flush: tokio::sync::Mutex::new(()),
        });
        Ok(Self {
            lease: Some(Arc::new(HandleLease {
                inner: Arc::clone(&inner),
            })),
            inner,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Router for inbound listeners and the outbound queue.
    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn status(&self) -> ConnectionState {
        self.inner.link.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Automatic reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.link.lock().reconnect_attempts
    }

    /// Message of the most recent connection failure, cleared on open.
    pub fn last_error(&self) -> Option<String> {
        self.inner.link.lock().last_error.clone()
    }

    /// Listen to status transitions. Not invoked for the current status.
    pub fn on_status_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.status_listeners.add((), Arc::new(listener))
    }

    /// Shorthand for [`MessageRouter::on`].
    pub fn on<F>(&self, message_type: &str, callback: F) -> Result<Subscription, RouterError>
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.inner.router.on(message_type, callback)
    }

    /// Shorthand for [`MessageRouter::on_any`].
    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.inner.router.on_any(callback)
    }

    /// Shorthand for [`MessageRouter::off`].
    pub fn off(&self, message_type: &str) -> usize {
        self.inner.router.off(message_type)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the channel.
    ///
    /// Resolves once the transport is open and the outbound queue has been
    /// drained. A no-op while connected; fails with
    /// [`ConnectionError::ConnectInProgress`] while another call is opening.
    /// Also recovers from the error status reached after reconnection gave up.
    pub async fn connect(&self) -> ConnectionResult<()> {
        let started = self.update(|link| {
            match link.status {
                ConnectionState::Connected => return Ok(None),
                ConnectionState::Connecting => return Err(ConnectionError::ConnectInProgress),
                _ => {}
            }
            if let Some(previous) = link.session.take() {
                previous.cancel();
            }
            link.epoch.0 += 1;
            link.reconnect_attempts = 0;
            link.status = ConnectionState::Connecting;
            let session = CancellationToken::new();
            link.session = Some(session.clone());
            Ok(Some((link.epoch, session)))
        })?;
        let Some((epoch, session)) = started else {
            return Ok(());
        };

        info!(epoch = epoch.0, url = %self.inner.config.url, "Connecting");
        let guard = ConnectGuard {
            manager: self,
            epoch,
            armed: true,
        };
        let opened = tokio::select! {
            biased;
            _ = session.cancelled() => return Err(ConnectionError::Aborted),
            opened = self.open() => opened,
        };
        guard.disarm();

        let transport = match opened {
            Ok(transport) => transport,
            Err(err) => {
                warn!(epoch = epoch.0, error = %err, "Connect failed");
                let message = err.to_string();
                self.update(|link| {
                    if link.epoch == epoch {
                        link.status = ConnectionState::Error;
                        link.session = None;
                        link.last_error = Some(message);
                    }
                });
                return Err(err);
            }
        };

        if !self.activate(epoch) {
            return Err(ConnectionError::Aborted);
        }
        info!(epoch = epoch.0, "Connected");

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(
            self.detached()
                .connection_driver(epoch, session, transport, Some(ready_tx)),
        );
        // Dropped without a signal when the link ends before the first flush.
        let _ = ready_rx.await;
        Ok(())
    }

    /// Close the channel with a normal close code and stop reconnecting.
    pub fn disconnect(&self) {
        let session = self.update(|link| {
            link.epoch.0 += 1;
            link.reconnect_attempts = 0;
            link.status = ConnectionState::Disconnected;
            link.session.take()
        });
        if let Some(session) = session {
            session.cancel();
            info!("Disconnected by client");
        }
    }

    /// Send `message`, stamping its timestamp and id if absent.
    ///
    /// Returns `true` when connected; the driver then writes it in FIFO
    /// order behind anything already queued. Otherwise the message waits in
    /// the queue until the next successful (re)connect and `false` is
    /// returned.
    pub fn send(&self, message: ChannelMessage) -> bool {
        let message = message.stamped();
        let message_type = message.message_type.clone();
        self.inner.router.enqueue(message);

        let connected = self.is_connected();
        if connected {
            self.inner.outbound_ready.notify_one();
        } else {
            debug!(
                message_type = %message_type,
                queued = self.inner.router.queued_len(),
                "Queued message until connected"
            );
        }
        connected
    }

    /// Copy for the driver task; it does not count as a handle.
    fn detached(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lease: None,
        }
    }

    // ------------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------------

    async fn connection_driver(
        self,
        epoch: ConnectionEpoch,
        session: CancellationToken,
        mut transport: Box<dyn Transport>,
        mut ready: Option<oneshot::Sender<()>>,
    ) {
        loop {
            let cause = match self
                .connection_task(&session, transport.as_mut(), ready.take())
                .await
            {
                LinkEnd::Shutdown => {
                    if let Err(err) = transport.close(NORMAL_CLOSURE, "client disconnect").await {
                        debug!(error = %err, "Close handshake failed");
                    }
                    return;
                }
                LinkEnd::Normal => {
                    info!(epoch = epoch.0, "Channel closed normally");
                    self.update(|link| {
                        if link.epoch == epoch {
                            link.status = ConnectionState::Disconnected;
                            link.session = None;
                        }
                    });
                    return;
                }
                LinkEnd::Lost(cause) => cause,
            };

            warn!(epoch = epoch.0, error = %cause, "Channel lost");
            transport = match self.reconnect(epoch, &session, cause).await {
                Some(next) => next,
                None => return,
            };
        }
    }

    async fn connection_task(
        &self,
        session: &CancellationToken,
        transport: &mut dyn Transport,
        ready: Option<oneshot::Sender<()>>,
    ) -> LinkEnd {
        if let Err(err) = self.flush(session, transport).await {
            return LinkEnd::Lost(err);
        }
        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        let period = self.inner.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            let pong_wait = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = session.cancelled() => return LinkEnd::Shutdown,
                event = transport.recv() => match event {
                    Some(TransportEvent::Frame(text)) => match self.inner.router.dispatch(&text) {
                        Dispatch::Pong => pong_deadline = None,
                        Dispatch::Ping => {
                            if let Err(err) = send_message(transport, &ChannelMessage::pong()).await {
                                return LinkEnd::Lost(err);
                            }
                        }
                        _ => {}
                    },
                    Some(TransportEvent::Closed { code, reason }) => {
                        if code == Some(NORMAL_CLOSURE) {
                            return LinkEnd::Normal;
                        }
                        let code = code.or(Some(ABNORMAL_CLOSURE));
                        return LinkEnd::Lost(ConnectionError::closed(code, reason));
                    }
                    None => {
                        return LinkEnd::Lost(ConnectionError::closed(
                            Some(ABNORMAL_CLOSURE),
                            "stream ended",
                        ));
                    }
                },
                _ = self.inner.outbound_ready.notified() => {
                    if let Err(err) = self.flush(session, transport).await {
                        return LinkEnd::Lost(err);
                    }
                }
                _ = pong_wait => {
                    let limit = self.inner.config.pong_timeout.unwrap_or(period);
                    return LinkEnd::Lost(ConnectionError::timeout(limit));
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = send_message(transport, &ChannelMessage::ping()).await {
                        return LinkEnd::Lost(err);
                    }
                    if let Some(limit) = self.inner.config.pong_timeout {
                        pong_deadline.get_or_insert_with(|| Instant::now() + limit);
                    }
                    debug!("Heartbeat sent");
                }
            }
        }
    }

    /// Write queued messages in FIFO order until the queue is empty or the
    /// session ends. A failed or interrupted write puts its message back at
    /// the front.
    async fn flush(
        &self,
        session: &CancellationToken,
        transport: &mut dyn Transport,
    ) -> ConnectionResult<usize> {
        let _flushing = self.inner.flush.lock().await;
        let mut sent = 0;
        while !session.is_cancelled() {
            let Some(message) = self.inner.router.next_outbound() else {
                break;
            };
            let written = tokio::select! {
                biased;
                _ = session.cancelled() => None,
                written = send_message(transport, &message) => Some(written),
            };
            match written {
                Some(Ok(())) => sent += 1,
                Some(Err(err)) => {
                    self.inner.router.requeue_front(message);
                    return Err(err);
                }
                None => {
                    self.inner.router.requeue_front(message);
                    break;
                }
            }
        }
        if sent > 0 {
            debug!(sent, "Flushed outbound queue");
        }
        Ok(sent)
    }

    /// Reconnect after an abnormal close. Returns the new transport, or
    /// `None` when attempts are exhausted or the epoch was superseded.
    async fn reconnect(
        &self,
        epoch: ConnectionEpoch,
        session: &CancellationToken,
        mut cause: ConnectionError,
    ) -> Option<Box<dyn Transport>> {
        let max_attempts = self.inner.config.max_reconnect_attempts;

        loop {
            let message = cause.to_string();
            let next = self.update(|link| {
                if link.epoch != epoch {
                    return None;
                }
                if link.reconnect_attempts >= max_attempts {
                    link.status = ConnectionState::Error;
                    link.session = None;
                    link.last_error = Some(
                        ConnectionError::ReconnectExhausted {
                            attempts: link.reconnect_attempts,
                        }
                        .to_string(),
                    );
                    return Some(None);
                }
                link.reconnect_attempts += 1;
                link.status = ConnectionState::Reconnecting;
                link.last_error = Some(message);
                Some(Some(link.reconnect_attempts))
            });
            let attempt = match next {
                None => return None,
                Some(None) => {
                    warn!(
                        epoch = epoch.0,
                        attempts = max_attempts,
                        "Reconnection attempts exhausted"
                    );
                    return None;
                }
                Some(Some(attempt)) => attempt,
            };

            let delay = self.inner.config.reconnect.delay_for_attempt(attempt);
            info!(
                epoch = epoch.0,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );

            let opened = tokio::select! {
                biased;
                _ = session.cancelled() => return None,
                opened = async {
                    sleep(delay).await;
                    self.open().await
                } => opened,
            };

            match opened {
                Ok(transport) => {
                    if !self.activate(epoch) {
                        return None;
                    }
                    info!(epoch = epoch.0, attempt, "Reconnected");
                    return Some(transport);
                }
                Err(err) => {
                    warn!(epoch = epoch.0, attempt, error = %err, "Reconnect attempt failed");
                    cause = err;
                }
            }
        }
    }

    /// Open a transport to a fresh session URL, bounded by the connect
    /// timeout.
    async fn open(&self) -> ConnectionResult<Box<dyn Transport>> {
        let credential = ulid::Ulid::new().to_string();
        let url = self.inner.config.session_url(&credential)?;
        let limit = self.inner.config.connect_timeout;
        match timeout(limit, self.inner.connector.connect(&url)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::timeout(limit)),
        }
    }

    /// Mark `epoch` connected. False when it has been superseded.
    fn activate(&self, epoch: ConnectionEpoch) -> bool {
        self.update(|link| {
            if link.epoch != epoch {
                return false;
            }
            link.status = ConnectionState::Connected;
            link.reconnect_attempts = 0;
            link.last_error = None;
            true
        })
    }

    /// Mutate link state; status listeners run after the lock is released
    /// when the status changed.
    fn update<R>(&self, f: impl FnOnce(&mut LinkState) -> R) -> R {
        let _order = self.inner.notify.lock();
        let (result, before, after) = {
            let mut link = self.inner.link.lock();
            let before = link.status;
            let result = f(&mut link);
            (result, before, link.status)
        };
        if before != after {
            debug!(from = %before, to = %after, "Connection state changed");
            self.inner.status_listeners.emit(&(), &after);
        }
        result
    }
}

async fn send_message(
    transport: &mut dyn Transport,
    message: &ChannelMessage,
) -> ConnectionResult<()> {
    let frame = serde_json::to_string(message)?;
    transport.send(frame).await
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.inner.link.lock();
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url)
            .field("status", &link.status)
            .field("epoch", &link.epoch)
            .field("reconnect_attempts", &link.reconnect_attempts)
            .finish()
    }
}
