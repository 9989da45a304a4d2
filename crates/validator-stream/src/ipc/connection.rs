//! Connection to the validator.
//!
//! A `Connection` owns at most one socket at a time, the pending request table
//! and the reconnect schedule. Socket events arrive on one ordered channel and
//! are consumed by a single event loop task; callers only ever touch shared
//! state under one mutex that is never held across an `.await`.
//!
//! ```text
//! Disconnected --connect()--> Connecting --connected--> Connected
//!       ^                          |                        |
//!       +------- disconnected -----+------------------------+
//!       |
//!       +--(backoff)--> Connecting ...      close(): Disconnected, terminal
//! ```

use crate::codec;
use crate::domain::{
    ConfigError, ConnectionConfig, CorrelationId, Envelope, MessageType, TransportError,
    TransportResult,
};
use crate::ipc::backoff::ExponentialBackoff;
use crate::ipc::dispatcher::{self, DispatchStats, InboundHandler, InboundQueue, Route};
use crate::ipc::pending::{PendingStats, PendingTable, ReplySlot, Resolution};
use crate::ipc::socket::{Control, EventSink, MessageSocket, SocketEvent, SocketFactory};
use crate::ipc::tcp::TcpSocketFactory;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Point-in-time connection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Requests currently awaiting a reply
    pub pending: usize,
    pub registered: u64,
    pub replied: u64,
    pub timeouts: u64,
    pub connection_lost: u64,
    pub closed: u64,
    pub cancelled: u64,
    pub send_failures: u64,
    pub late_replies: u64,
    pub forwarded: u64,
    pub unhandled: u64,
    pub malformed: u64,
    /// Sockets opened after the first one
    pub reconnect_attempts: u64,
}

type ConnectHook = Arc<dyn Fn() + Send + Sync>;

/// Everything guarded by the connection mutex.
struct Shared {
    started: bool,
    closed: bool,
    /// Generation of the current (or next) socket
    generation: u64,
    socket: Option<Box<dyn MessageSocket>>,
    pending: PendingTable,
    on_connect: Option<ConnectHook>,
    inbound: Option<InboundQueue>,
}

struct Inner {
    config: ConnectionConfig,
    factory: Arc<dyn SocketFactory>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Control>>>,
    pending_stats: Arc<PendingStats>,
    dispatch_stats: DispatchStats,
    reconnect_attempts: AtomicU64,
}

/// Correlated request/response channel to one validator.
///
/// Cheap to clone; clones share the same socket and pending table.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create an unconnected connection that builds sockets with `factory`.
    pub fn new(
        config: ConnectionConfig,
        factory: Arc<dyn SocketFactory>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let pending = PendingTable::new(&config.retired_ids);
        let pending_stats = pending.stats();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                factory,
                shared: Mutex::new(Shared {
                    started: false,
                    closed: false,
                    generation: 0,
                    socket: None,
                    pending,
                    on_connect: None,
                    inbound: None,
                }),
                state_tx,
                control_tx,
                control_rx: Mutex::new(Some(control_rx)),
                pending_stats,
                dispatch_stats: DispatchStats::default(),
                reconnect_attempts: AtomicU64::new(0),
            }),
        })
    }

    /// Create a connection over TCP.
    pub fn tcp(config: ConnectionConfig) -> Result<Self, ConfigError> {
        let factory = Arc::new(TcpSocketFactory::new(config.max_frame_len));
        Self::new(config, factory)
    }

    /// Open the first socket and start the event loop.
    ///
    /// `on_connect` runs every time a socket reports connected, including
    /// after each automatic reconnect.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn connect<F>(&self, on_connect: F) -> TransportResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let mut shared = inner.shared.lock();

        if shared.closed {
            return Err(TransportError::Closed);
        }
        if shared.started {
            return Err(TransportError::AlreadyConnected);
        }
        let Some(control_rx) = inner.control_rx.lock().take() else {
            return Err(TransportError::AlreadyConnected);
        };

        let socket = inner.factory.create();
        let events = EventSink::new(shared.generation, inner.control_tx.clone());
        if let Err(e) = socket.connect(&inner.config.url, events) {
            shared.generation += 1;
            *inner.control_rx.lock() = Some(control_rx);
            warn!(url = %inner.config.url, error = %e, "Validator socket rejected connect");
            return Err(e.into());
        }

        shared.started = true;
        shared.socket = Some(socket);
        shared.on_connect = Some(Arc::new(on_connect));
        inner.set_state(ConnectionState::Connecting);
        drop(shared);

        info!(url = %inner.config.url, "Connecting to validator");

        let backoff = ExponentialBackoff::new(&inner.config.reconnect);
        tokio::spawn(run_event_loop(Arc::downgrade(inner), control_rx, backoff));
        Ok(())
    }

    /// Send a request and wait for the reply with the same correlation id.
    ///
    /// `timeout` overrides the configured default; with neither, the call
    /// waits until a reply, a disconnect or `close()`. Dropping the returned
    /// future abandons the request.
    pub async fn call(
        &self,
        message_type: MessageType,
        content: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> TransportResult<Bytes> {
        let correlation_id = CorrelationId::generate();
        let frame = codec::encode(&Envelope::new(
            message_type,
            correlation_id.clone(),
            content,
        ));

        let mut slot = self
            .inner
            .send_request(&correlation_id, message_type, frame)?;
        let mut guard = PendingGuard {
            inner: &self.inner,
            correlation_id: &correlation_id,
            armed: true,
        };

        let limit = timeout.or_else(|| self.inner.config.default_timeout());
        let outcome = match limit {
            None => (&mut slot).await,
            Some(limit) => match tokio::time::timeout(limit, &mut slot).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let error = TransportError::Timeout {
                        correlation_id: correlation_id.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    };
                    self.inner
                        .shared
                        .lock()
                        .pending
                        .settle(&correlation_id, Resolution::Fail(error));
                    // A reply may have won the race; the slot holds whichever settled first.
                    (&mut slot).await
                }
            },
        };

        guard.armed = false;
        outcome.unwrap_or(Err(TransportError::ConnectionLost))
    }

    /// Send a reply to a call the validator made, reusing its correlation id.
    ///
    /// Fire-and-forget: nothing is awaited, and without a socket the reply is
    /// dropped. Socket failures are logged.
    pub fn reply_to(
        &self,
        message_type: MessageType,
        correlation_id: &CorrelationId,
        content: impl Into<Bytes>,
    ) {
        self.inner.reply_to(message_type, correlation_id, content.into());
    }

    /// A reply-only handle that does not keep the connection alive.
    pub fn replier(&self) -> Replier {
        Replier {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register the handler for envelopes that are not replies to our calls.
    ///
    /// Each envelope gets its own handler task, started in arrival order, with
    /// at most `inbound_concurrency` running at once.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn on_inbound<H: InboundHandler>(&self, handler: H) -> TransportResult<()> {
        let mut shared = self.inner.shared.lock();
        if shared.closed {
            return Err(TransportError::Closed);
        }
        if shared.inbound.is_some() {
            return Err(TransportError::HandlerAlreadyRegistered);
        }

        let (queue, _task) = InboundQueue::spawn(
            Arc::new(handler),
            self.replier(),
            self.inner.config.inbound_concurrency,
        );
        shared.inbound = Some(queue);
        Ok(())
    }

    /// Close the socket, fail every pending call with `Closed` and stop
    /// reconnecting. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        let mut shared = inner.shared.lock();
        if shared.closed {
            return;
        }

        shared.closed = true;
        shared.generation += 1;
        if let Some(socket) = shared.socket.take() {
            socket.close();
        }
        let failed = shared.pending.fail_all(TransportError::Closed);
        shared.inbound = None;
        shared.on_connect = None;
        inner.set_state(ConnectionState::Disconnected);
        drop(shared);

        let _ = inner.control_tx.send(Control::Shutdown);
        info!(url = %inner.config.url, failed, "Closed validator connection");
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of calls awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.lock().closed
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Get current statistics snapshot
    pub fn stats(&self) -> ConnectionStats {
        let pending = self.inner.pending_stats.as_ref();
        let dispatch = &self.inner.dispatch_stats;

        ConnectionStats {
            pending: self.pending_count(),
            registered: pending.total_registered.load(Ordering::Relaxed),
            replied: pending.total_replied.load(Ordering::Relaxed),
            timeouts: pending.total_timeouts.load(Ordering::Relaxed),
            connection_lost: pending.total_connection_lost.load(Ordering::Relaxed),
            closed: pending.total_closed.load(Ordering::Relaxed),
            cancelled: pending.total_cancelled.load(Ordering::Relaxed),
            send_failures: pending.total_send_failures.load(Ordering::Relaxed),
            late_replies: dispatch.late_replies.load(Ordering::Relaxed),
            forwarded: dispatch.forwarded.load(Ordering::Relaxed),
            unhandled: dispatch.unhandled.load(Ordering::Relaxed),
            malformed: dispatch.malformed.load(Ordering::Relaxed),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Sends replies on behalf of an inbound handler.
///
/// Holds the connection weakly: once every `Connection` handle is gone,
/// replies are dropped and the connection shuts down.
#[derive(Clone)]
pub struct Replier {
    inner: Weak<Inner>,
}

impl Replier {
    /// A replier attached to no connection; every reply is dropped.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    /// Same as [`Connection::reply_to`]. Returns false if the connection is gone.
    pub fn reply_to(
        &self,
        message_type: MessageType,
        correlation_id: &CorrelationId,
        content: impl Into<Bytes>,
    ) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.reply_to(message_type, correlation_id, content.into());
                true
            }
            None => {
                debug!(correlation_id = %correlation_id, "Connection dropped, discarding reply");
                false
            }
        }
    }

    /// Reply to `request`, reusing its correlation id.
    pub fn reply(
        &self,
        request: &Envelope,
        message_type: MessageType,
        content: impl Into<Bytes>,
    ) -> bool {
        self.reply_to(message_type, request.correlation_id(), content)
    }
}

impl fmt::Debug for Replier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replier")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Abandons the pending entry if the call future is dropped mid-flight.
struct PendingGuard<'a> {
    inner: &'a Inner,
    correlation_id: &'a CorrelationId,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner
                .shared
                .lock()
                .pending
                .settle(self.correlation_id, Resolution::Abandon);
        }
    }
}

impl Inner {
    fn reply_to(&self, message_type: MessageType, correlation_id: &CorrelationId, content: Bytes) {
        let frame = codec::encode(&Envelope::new(
            message_type,
            correlation_id.clone(),
            content,
        ));

        let shared = self.shared.lock();
        let Some(socket) = shared.socket.as_ref() else {
            debug!(
                correlation_id = %correlation_id,
                message_type = %message_type,
                "No validator socket, dropping reply"
            );
            return;
        };

        match socket.send(frame) {
            Ok(()) => debug!(
                correlation_id = %correlation_id,
                message_type = %message_type,
                "Sent reply"
            ),
            Err(e) => warn!(
                correlation_id = %correlation_id,
                message_type = %message_type,
                error = %e,
                "Failed to send reply"
            ),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn send_request(
        &self,
        correlation_id: &CorrelationId,
        message_type: MessageType,
        frame: Bytes,
    ) -> TransportResult<ReplySlot> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(TransportError::Closed);
        }
        if !shared.started {
            return Err(TransportError::NotConnected);
        }

        let Shared {
            socket, pending, ..
        } = &mut *shared;
        let Some(socket) = socket.as_ref() else {
            return Err(TransportError::ConnectionLost);
        };

        let slot = pending.register(correlation_id.clone(), message_type);
        if let Err(e) = socket.send(frame) {
            pending.settle(correlation_id, Resolution::Unsent);
            warn!(
                correlation_id = %correlation_id,
                message_type = %message_type,
                error = %e,
                "Failed to send request"
            );
            return Err(e.into());
        }

        debug!(
            correlation_id = %correlation_id,
            message_type = %message_type,
            pending = pending.len(),
            "Sent request"
        );
        Ok(slot)
    }

    fn handle_socket_event(
        &self,
        generation: u64,
        event: SocketEvent,
        backoff: &mut ExponentialBackoff,
    ) {
        let mut shared = self.shared.lock();
        if shared.closed || generation != shared.generation {
            debug!(
                generation,
                current = shared.generation,
                "Ignoring event from stale socket"
            );
            return;
        }

        match event {
            SocketEvent::Connected => {
                if *self.state_tx.borrow() == ConnectionState::Connected {
                    return;
                }
                self.set_state(ConnectionState::Connected);
                backoff.reset();
                let hook = shared.on_connect.clone();
                drop(shared);

                info!(url = %self.config.url, generation, "Connected to validator");
                if let Some(hook) = hook {
                    hook();
                }
            }
            SocketEvent::Disconnected => {
                if let Some(socket) = shared.socket.take() {
                    socket.close();
                }
                let failed = shared.pending.fail_all(TransportError::ConnectionLost);
                shared.generation += 1;
                let next = shared.generation;
                self.set_state(ConnectionState::Disconnected);
                drop(shared);

                let delay = backoff.next_delay();
                warn!(
                    url = %self.config.url,
                    failed,
                    retry_in_ms = delay.as_millis() as u64,
                    "Lost connection to validator"
                );
                self.schedule_reconnect(next, delay);
            }
            SocketEvent::Message(frame) => self.dispatch_frame(&mut shared, frame),
        }
    }

    fn dispatch_frame(&self, shared: &mut Shared, frame: Bytes) {
        let stats = &self.dispatch_stats;

        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Dropping malformed frame from validator");
                return;
            }
        };

        match dispatcher::route(&mut shared.pending, envelope) {
            Route::Reply => {}
            Route::Late(envelope) => {
                stats.late_replies.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %envelope.correlation_id(),
                    message_type = %envelope.message_type(),
                    "Dropping reply to a request that already ended"
                );
            }
            Route::Inbound(envelope) => {
                let delivered = match &shared.inbound {
                    Some(queue) => queue.push(envelope),
                    None => {
                        warn!(
                            correlation_id = %envelope.correlation_id(),
                            message_type = %envelope.message_type(),
                            "No inbound handler registered, dropping message"
                        );
                        false
                    }
                };
                let counter = if delivered {
                    &stats.forwarded
                } else {
                    &stats.unhandled
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn reconnect(&self, generation: u64, backoff: &mut ExponentialBackoff) {
        let mut shared = self.shared.lock();
        if shared.closed || generation != shared.generation || shared.socket.is_some() {
            return;
        }

        let socket = self.factory.create();
        let events = EventSink::new(generation, self.control_tx.clone());
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);

        match socket.connect(&self.config.url, events) {
            Ok(()) => {
                shared.socket = Some(socket);
                debug!(url = %self.config.url, generation, "Reconnecting to validator");
            }
            Err(e) => {
                shared.generation += 1;
                let next = shared.generation;
                self.set_state(ConnectionState::Disconnected);
                drop(shared);

                let delay = backoff.next_delay();
                warn!(
                    url = %self.config.url,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconnect attempt failed"
                );
                self.schedule_reconnect(next, delay);
            }
        }
    }

    fn schedule_reconnect(&self, generation: u64, delay: Duration) {
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control_tx.send(Control::Reconnect { generation });
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        if let Some(socket) = shared.socket.take() {
            socket.close();
        }
        shared.inbound = None;
        let _ = self.control_tx.send(Control::Shutdown);
        debug!(url = %self.config.url, "Last connection handle dropped");
    }
}

/// Single consumer of socket events and reconnect timers.
///
/// Holds only a weak reference; nothing inside the connection holds a strong
/// one (inbound handlers get a [`Replier`]), so dropping every `Connection`
/// handle ends it.
async fn run_event_loop(
    inner: Weak<Inner>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    mut backoff: ExponentialBackoff,
) {
    while let Some(control) = control_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match control {
            Control::Socket { generation, event } => {
                inner.handle_socket_event(generation, event, &mut backoff)
            }
            Control::Reconnect { generation } => inner.reconnect(generation, &mut backoff),
            Control::Shutdown => break,
        }
    }
    debug!("Connection event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SocketError;
    use crate::ipc::channel::{channel_pair, ChannelPeer};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    fn config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("inproc://validator");
        config.reconnect.initial_backoff_ms = 5;
        config.reconnect.max_backoff_ms = 20;
        config.reconnect.jitter = false;
        config
    }

    async fn wait_state(conn: &Connection, state: ConnectionState) {
        let mut rx = conn.subscribe_state();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state change timed out")
            .expect("state channel closed");
    }

    async fn connected() -> (Connection, ChannelPeer) {
        let (factory, peer) = channel_pair();
        let conn = Connection::new(config(), Arc::new(factory)).unwrap();
        conn.connect(|| {}).unwrap();
        assert!(peer.accept());
        wait_state(&conn, ConnectionState::Connected).await;
        (conn, peer)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (factory, _peer) = channel_pair();
        let err = Connection::new(ConnectionConfig::new("  "), Arc::new(factory)).unwrap_err();
        assert_eq!(err, ConfigError::EmptyUrl);
    }

    #[tokio::test]
    async fn test_call_before_connect() {
        let (factory, _peer) = channel_pair();
        let conn = Connection::new(config(), Arc::new(factory)).unwrap();

        let err = conn
            .call(MessageType::TpStateGetRequest, "addr", None)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let (conn, _peer) = connected().await;
        assert_eq!(conn.connect(|| {}), Err(TransportError::AlreadyConnected));
    }

    #[tokio::test]
    async fn test_rejected_address_leaves_connection_unstarted() {
        let conn = Connection::tcp(ConnectionConfig::new("ipc://validator")).unwrap();

        let err = conn.connect(|| {}).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Socket(SocketError::InvalidAddress(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            conn.call(MessageType::PingRequest, Bytes::new(), None).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_reply_resolves_call() {
        let (conn, mut peer) = connected().await;

        let (result, ()) = futures::join!(
            conn.call(MessageType::TpStateGetRequest, "addr", None),
            async {
                let request = peer.recv_envelope().await.unwrap();
                assert_eq!(request.message_type(), MessageType::TpStateGetRequest);
                assert_eq!(request.content().as_ref(), b"addr");
                peer.deliver_envelope(&request.reply(MessageType::TpStateGetResponse, "value"));
            }
        );

        assert_eq!(result.unwrap().as_ref(), b"value");
        let stats = conn.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.replied, 1);
    }

    #[tokio::test]
    async fn test_send_failure_leaves_no_entry() {
        let (conn, peer) = connected().await;
        peer.set_fail_sends(true);

        let err = conn
            .call(MessageType::TpStateSetRequest, "data", None)
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Socket(SocketError::SendFailed(_))));
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.stats().send_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_is_abandoned() {
        let (conn, _peer) = connected().await;

        let result = timeout(
            Duration::from_millis(20),
            conn.call(MessageType::PingRequest, Bytes::new(), None),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.stats().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let (factory, _peer) = channel_pair();
        let mut config = config();
        config.default_timeout_ms = Some(20);
        let conn = Connection::new(config, Arc::new(factory)).unwrap();
        conn.connect(|| {}).unwrap();

        let err = conn
            .call(MessageType::PingRequest, Bytes::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { timeout_ms: 20, .. }));
        assert_eq!(conn.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_is_terminal() {
        let (conn, mut peer) = connected().await;

        let (result, ()) = futures::join!(
            conn.call(MessageType::TpStateGetRequest, "addr", None),
            async {
                peer.recv_frame().await.unwrap();
                conn.close();
                conn.close();
            }
        );

        assert_eq!(result, Err(TransportError::Closed));
        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            conn.call(MessageType::PingRequest, Bytes::new(), None).await,
            Err(TransportError::Closed)
        );
        assert_eq!(conn.connect(|| {}), Err(TransportError::Closed));
        assert_eq!(conn.stats().closed, 1);

        // No reconnect after close.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(peer.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_on_connect_runs_after_every_connect() {
        let (factory, peer) = channel_pair();
        let conn = Connection::new(config(), Arc::new(factory)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let hook_count = Arc::clone(&count);
        conn.connect(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        peer.accept();
        wait_state(&conn, ConnectionState::Connected).await;
        // Duplicate connected events do not re-run the hook.
        peer.accept();

        peer.disconnect();
        peer.wait_for_attempts(2).await;
        peer.accept();
        wait_state(&conn, ConnectionState::Connected).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(conn.stats().reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_reconnect_keeps_retrying() {
        let (conn, peer) = connected().await;
        peer.set_reject_connect(true);

        assert!(peer.disconnect());
        timeout(Duration::from_secs(5), peer.wait_for_attempts(4))
            .await
            .expect("connection stopped retrying");

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!peer.is_open());
        assert_eq!(conn.stats().reconnect_attempts, 3);
        assert_eq!(
            conn.call(MessageType::PingRequest, Bytes::new(), None).await,
            Err(TransportError::ConnectionLost)
        );

        peer.set_reject_connect(false);
        timeout(Duration::from_secs(5), peer.wait_for_attempts(5))
            .await
            .expect("connection stopped retrying");
        assert!(peer.accept());
        wait_state(&conn, ConnectionState::Connected).await;
        assert_eq!(conn.stats().reconnect_attempts, 4);
    }

    #[tokio::test]
    async fn test_stale_socket_events_ignored() {
        let (conn, mut peer) = connected().await;

        peer.disconnect();
        peer.wait_for_attempts(2).await;
        peer.accept();
        wait_state(&conn, ConnectionState::Connected).await;

        let (result, ()) = futures::join!(
            conn.call(MessageType::TpStateGetRequest, "addr", None),
            async {
                let request = peer.recv_envelope().await.unwrap();
                // The first socket is gone; its disconnect must not touch the new one.
                conn.inner
                    .control_tx
                    .send(Control::Socket {
                        generation: 0,
                        event: SocketEvent::Disconnected,
                    })
                    .unwrap();
                peer.deliver_envelope(&request.reply(MessageType::TpStateGetResponse, "ok"));
            }
        );

        assert_eq!(result.unwrap().as_ref(), b"ok");
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_inbound_handler_registration() {
        let (conn, _peer) = connected().await;

        conn.on_inbound(|_env: Envelope, _replier: Replier| async {})
            .unwrap();
        assert_eq!(
            conn.on_inbound(|_env: Envelope, _replier: Replier| async {}),
            Err(TransportError::HandlerAlreadyRegistered)
        );
    }

    #[tokio::test]
    async fn test_dropping_last_handle_releases_socket() {
        let (conn, mut peer) = connected().await;
        let (kept_tx, mut kept_rx) = mpsc::unbounded_channel();

        conn.on_inbound(move |env: Envelope, replier: Replier| {
            let kept_tx = kept_tx.clone();
            async move {
                assert!(replier.reply(&env, MessageType::TpProcessResponse, "ok"));
                let _ = kept_tx.send(replier);
            }
        })
        .unwrap();

        peer.deliver_envelope(&Envelope::new(
            MessageType::TpProcessRequest,
            CorrelationId::parse("validator-call").unwrap(),
            "tx",
        ));
        let reply = peer.recv_envelope().await.unwrap();
        assert_eq!(reply.correlation_id().as_str(), "validator-call");
        let replier = kept_rx.recv().await.unwrap();

        drop(conn);

        assert!(!peer.is_open());
        assert!(!peer.disconnect());
        let id = CorrelationId::parse("validator-call-2").unwrap();
        assert!(!replier.reply_to(MessageType::TpProcessResponse, &id, "late"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.connect_attempts(), 1);
        assert!(peer.try_recv_frame().is_none());
    }

    #[tokio::test]
    async fn test_unhandled_and_malformed_are_counted() {
        let (conn, mut peer) = connected().await;

        peer.deliver(Bytes::from_static(&[0x0a]));
        let unsolicited = Envelope::new(
            MessageType::TpProcessRequest,
            CorrelationId::parse("validator-call").unwrap(),
            "tx",
        );
        peer.deliver_envelope(&unsolicited);

        // The loop is still alive: a round trip completes after both.
        let (result, ()) = futures::join!(
            conn.call(MessageType::PingRequest, Bytes::new(), None),
            async {
                let request = peer.recv_envelope().await.unwrap();
                peer.deliver_envelope(&request.reply(MessageType::PingResponse, Bytes::new()));
            }
        );
        assert!(result.is_ok());

        let stats = conn.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unhandled, 1);
        assert_eq!(stats.forwarded, 0);
    }

    #[tokio::test]
    async fn test_reply_to_reuses_correlation_id() {
        let (conn, mut peer) = connected().await;
        let id = CorrelationId::parse("validator-call").unwrap();

        conn.reply_to(MessageType::TpProcessResponse, &id, "done");

        let sent = peer.recv_envelope().await.unwrap();
        assert_eq!(sent.correlation_id(), &id);
        assert_eq!(sent.message_type(), MessageType::TpProcessResponse);
        assert_eq!(sent.content().as_ref(), b"done");
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_to_without_socket_is_noop() {
        let (factory, mut peer) = channel_pair();
        let conn = Connection::new(config(), Arc::new(factory)).unwrap();
        let id = CorrelationId::parse("validator-call").unwrap();

        conn.reply_to(MessageType::TpProcessResponse, &id, "done");
        assert!(peer.try_recv_frame().is_none());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
