//! TCP message socket.
//!
//! Frames travel as a big-endian `u32` length followed by the frame bytes.
//! Each socket owns one background task that connects, then reads and writes
//! until either side fails; the task reports `disconnected` exactly once.

use crate::domain::SocketError;
use crate::ipc::socket::{EventSink, MessageSocket, SocketEvent, SocketFactory};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SCHEME: &str = "tcp://";

/// Resolve `tcp://host:port` or `host:port` to a connectable `host:port`.
pub fn parse_address(address: &str) -> Result<String, SocketError> {
    let invalid = || SocketError::InvalidAddress(address.to_string());

    let rest = address.strip_prefix(SCHEME).unwrap_or(address);
    if rest.contains("://") {
        return Err(invalid());
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(rest.to_string())
        }
        _ => Err(invalid()),
    }
}

/// Builds [`TcpSocket`]s sharing one frame limit.
#[derive(Debug, Clone)]
pub struct TcpSocketFactory {
    max_frame_len: usize,
}

impl TcpSocketFactory {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl SocketFactory for TcpSocketFactory {
    fn create(&self) -> Box<dyn MessageSocket> {
        Box::new(TcpSocket::new(self.max_frame_len))
    }
}

struct Active {
    outbound: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

/// One TCP connection attempt and its lifetime.
pub struct TcpSocket {
    max_frame_len: usize,
    active: Mutex<Option<Active>>,
}

impl TcpSocket {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            // The length prefix is a u32.
            max_frame_len: max_frame_len.min(u32::MAX as usize),
            active: Mutex::new(None),
        }
    }
}

impl MessageSocket for TcpSocket {
    fn connect(&self, address: &str, events: EventSink) -> Result<(), SocketError> {
        let target = parse_address(address)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SocketError::NoRuntime)?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let max_frame_len = self.max_frame_len;
        let task = runtime.spawn(run(target, events, outbound_rx, max_frame_len));

        if let Some(previous) = self.active.lock().replace(Active { outbound, task }) {
            previous.task.abort();
        }
        Ok(())
    }

    fn send(&self, frame: Bytes) -> Result<(), SocketError> {
        if frame.len() > self.max_frame_len {
            return Err(SocketError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }

        let active = self.active.lock();
        let active = active.as_ref().ok_or(SocketError::NotOpen)?;
        active
            .outbound
            .send(frame)
            .map_err(|_| SocketError::NotOpen)
    }

    fn close(&self) {
        if let Some(active) = self.active.lock().take() {
            active.task.abort();
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    target: String,
    events: EventSink,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    max_frame_len: usize,
) {
    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(address = %target, error = %e, "Failed to connect to validator");
            events.disconnected();
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not disable Nagle on validator socket");
    }

    info!(address = %target, "Connected to validator");
    events.connected();

    let (reader, writer) = stream.into_split();
    let result = tokio::select! {
        result = read_frames(reader, &events, max_frame_len) => result,
        result = write_frames(writer, outbound) => result,
    };

    match result {
        Ok(()) => info!(address = %target, "Validator connection closed"),
        Err(e) => warn!(address = %target, error = %e, "Validator connection failed"),
    }
    events.disconnected();
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    events: &EventSink,
    max_frame_len: usize,
) -> io::Result<()> {
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        if len > max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("inbound frame of {} bytes exceeds limit of {}", len, max_frame_len),
            ));
        }

        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        if !events.emit(SocketEvent::Message(Bytes::from(frame))) {
            return Ok(());
        }
    }
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    while let Some(frame) = outbound.recv().await {
        // Length fits: send() enforces the limit.
        writer.write_u32(frame.len() as u32).await?;
        writer.write_all(&frame).await?;
    }
    writer.shutdown().await
}
