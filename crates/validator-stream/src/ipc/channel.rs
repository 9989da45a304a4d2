//! In-memory socket for tests and in-process embedding.
//!
//! [`channel_pair`] returns a factory to hand to a `Connection` and a
//! [`ChannelPeer`] that plays the validator: it sees every frame the
//! connection sends and decides when the socket connects, drops or delivers.

use crate::codec;
use crate::domain::{Envelope, SocketError};
use crate::ipc::socket::{EventSink, MessageSocket, SocketEvent, SocketFactory};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct PeerState {
    /// Sink of the most recently connected socket
    current: Option<EventSink>,
    attempts: usize,
    last_address: Option<String>,
    auto_accept: bool,
    fail_sends: bool,
    reject_connect: bool,
}

struct Shared {
    state: Mutex<PeerState>,
    frames_tx: mpsc::UnboundedSender<Bytes>,
    attempt_made: Notify,
}

/// Create a connected factory/peer pair.
pub fn channel_pair() -> (ChannelSocketFactory, ChannelPeer) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        state: Mutex::new(PeerState::default()),
        frames_tx,
        attempt_made: Notify::new(),
    });

    (
        ChannelSocketFactory {
            shared: Arc::clone(&shared),
        },
        ChannelPeer { shared, frames_rx },
    )
}

/// Builds [`ChannelSocket`]s wired to one peer.
pub struct ChannelSocketFactory {
    shared: Arc<Shared>,
}

impl SocketFactory for ChannelSocketFactory {
    fn create(&self) -> Box<dyn MessageSocket> {
        Box::new(ChannelSocket {
            shared: Arc::clone(&self.shared),
            sink: Mutex::new(None),
        })
    }
}

/// One in-memory socket; frames go straight to the peer's queue.
pub struct ChannelSocket {
    shared: Arc<Shared>,
    sink: Mutex<Option<EventSink>>,
}

impl MessageSocket for ChannelSocket {
    fn connect(&self, address: &str, events: EventSink) -> Result<(), SocketError> {
        if address.trim().is_empty() {
            return Err(SocketError::InvalidAddress(address.to_string()));
        }

        let auto_accept = {
            let mut state = self.shared.state.lock();
            state.attempts += 1;
            state.last_address = Some(address.to_string());
            if state.reject_connect {
                drop(state);
                self.shared.attempt_made.notify_waiters();
                return Err(SocketError::Refused(address.to_string()));
            }
            state.current = Some(events.clone());
            state.auto_accept
        };

        *self.sink.lock() = Some(events.clone());

        if auto_accept {
            events.connected();
        }
        self.shared.attempt_made.notify_waiters();
        Ok(())
    }

    fn send(&self, frame: Bytes) -> Result<(), SocketError> {
        if self.sink.lock().is_none() {
            return Err(SocketError::NotOpen);
        }
        if self.shared.state.lock().fail_sends {
            return Err(SocketError::SendFailed("peer refused frame".into()));
        }
        self.shared
            .frames_tx
            .send(frame)
            .map_err(|_| SocketError::SendFailed("peer dropped".into()))
    }

    fn close(&self) {
        let Some(sink) = self.sink.lock().take() else {
            return;
        };
        let mut state = self.shared.state.lock();
        if state
            .current
            .as_ref()
            .is_some_and(|current| current.generation() == sink.generation())
        {
            state.current = None;
        }
    }
}

/// The validator side of an in-memory socket.
pub struct ChannelPeer {
    shared: Arc<Shared>,
    frames_rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelPeer {
    /// Report `connected` immediately on every future connect attempt.
    pub fn set_auto_accept(&self, auto_accept: bool) {
        self.shared.state.lock().auto_accept = auto_accept;
    }

    /// Make every `send` on the connection side fail synchronously.
    pub fn set_fail_sends(&self, fail: bool) {
        self.shared.state.lock().fail_sends = fail;
    }

    /// Make every future `connect` fail synchronously. Attempts are still counted.
    pub fn set_reject_connect(&self, reject: bool) {
        self.shared.state.lock().reject_connect = reject;
    }

    /// Report `connected` on the current socket.
    pub fn accept(&self) -> bool {
        self.current().is_some_and(|sink| sink.emit(SocketEvent::Connected))
    }

    /// Report `disconnected` on the current socket.
    pub fn disconnect(&self) -> bool {
        self.current()
            .is_some_and(|sink| sink.emit(SocketEvent::Disconnected))
    }

    /// Deliver a raw frame to the connection.
    pub fn deliver(&self, frame: Bytes) -> bool {
        self.current()
            .is_some_and(|sink| sink.emit(SocketEvent::Message(frame)))
    }

    /// Encode and deliver an envelope.
    pub fn deliver_envelope(&self, envelope: &Envelope) -> bool {
        self.deliver(codec::encode(envelope))
    }

    /// Next frame the connection sent.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        self.frames_rx.recv().await
    }

    /// Next frame the connection sent, decoded.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        let frame = self.recv_frame().await?;
        codec::decode(frame).ok()
    }

    /// A frame already sent, if any, without waiting.
    pub fn try_recv_frame(&mut self) -> Option<Bytes> {
        self.frames_rx.try_recv().ok()
    }

    /// Number of `connect` calls seen so far.
    pub fn connect_attempts(&self) -> usize {
        self.shared.state.lock().attempts
    }

    pub fn last_address(&self) -> Option<String> {
        self.shared.state.lock().last_address.clone()
    }

    /// True while a socket is open on the connection side.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().current.is_some()
    }

    /// Wait until at least `n` connect attempts happened.
    pub async fn wait_for_attempts(&self, n: usize) {
        loop {
            let notified = self.shared.attempt_made.notified();
            if self.connect_attempts() >= n {
                return;
            }
            notified.await;
        }
    }

    fn current(&self) -> Option<EventSink> {
        self.shared.state.lock().current.clone()
    }
}
