//! Socket collaborator interface.
//!
//! A socket only moves opaque frames. It reports what happens to it through
//! the [`EventSink`] it is given on `connect`; the connection consumes those
//! events from a single ordered queue.

use crate::domain::SocketError;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Something that happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    Disconnected,
    Message(Bytes),
}

/// Messages consumed by a connection's event loop.
#[derive(Debug)]
pub(crate) enum Control {
    /// Event from the socket opened as `generation`.
    Socket { generation: u64, event: SocketEvent },
    /// Backoff elapsed; open a new socket if still appropriate.
    Reconnect { generation: u64 },
    Shutdown,
}

/// Handle a socket uses to report events to its connection.
///
/// Every event is tagged with the generation of the socket it was handed to,
/// so a torn-down socket can never affect its successor.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Control>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Control>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected(&self) {
        self.emit(SocketEvent::Connected);
    }

    pub fn disconnected(&self) {
        self.emit(SocketEvent::Disconnected);
    }

    pub fn message(&self, frame: Bytes) {
        self.emit(SocketEvent::Message(frame));
    }

    /// Report an event. Returns false once the connection has gone away.
    pub fn emit(&self, event: SocketEvent) -> bool {
        self.tx
            .send(Control::Socket {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    /// True once the owning connection stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A message socket to the validator.
///
/// `connect` must not block: it starts connecting and reports progress through
/// the sink. `send` enqueues a frame and fails only if the frame cannot be
/// accepted at all. `close` releases resources; no further events may be
/// relied upon after it returns.
pub trait MessageSocket: Send + Sync {
    fn connect(&self, address: &str, events: EventSink) -> Result<(), SocketError>;

    fn send(&self, frame: Bytes) -> Result<(), SocketError>;

    fn close(&self);
}

/// Builds a fresh socket for every (re)connect attempt.
pub trait SocketFactory: Send + Sync {
    fn create(&self) -> Box<dyn MessageSocket>;
}
