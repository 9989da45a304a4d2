//! Validator Stream - correlated request/response transport to a validator.
//!
//! Transaction handlers talk to a validator over a socket that only moves
//! frames. This crate adds what the socket lacks: an envelope codec,
//! correlation ids, a table of in-flight requests, routing of unsolicited
//! messages, and reconnection that fails outstanding requests exactly once.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Handler code                             │
//! │        call()          reply_to()          on_inbound()      │
//! └──────────┬──────────────────┬───────────────────▲────────────┘
//!            │                  │                   │
//! ┌──────────▼──────────────────▼───────────────────┴────────────┐
//! │                       Connection                             │
//! │  ┌────────────────────┐          ┌────────────────────────┐  │
//! │  │   Pending Table    │◄─reply───│   Inbound Dispatcher   │  │
//! │  │ (oneshot per call) │          │ (else → handler tasks) │  │
//! │  └────────────────────┘          └───────────▲────────────┘  │
//! │        Envelope codec (protobuf `Message`)   │               │
//! │                                              │               │
//! │  Event loop: connected / disconnected / message, backoff     │
//! └──────────┬───────────────────────────────────┼───────────────┘
//!            │ frames                            │ events
//! ┌──────────▼───────────────────────────────────┴───────────────┐
//! │            MessageSocket (TCP or in-memory channel)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use validator_stream::{Connection, ConnectionConfig, MessageType};
//!
//! let connection = Connection::tcp(ConnectionConfig::from_env())?;
//! connection.connect(|| tracing::info!("validator is up"))?;
//!
//! let value = connection
//!     .call(MessageType::TpStateGetRequest, request_bytes, None)
//!     .await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod codec;
pub mod domain;
pub mod ipc;

// Re-exports for public API
pub use domain::{
    ApplicationError, ConfigError, ConnectionConfig, CorrelationId, DecodingError, EncodingError,
    Envelope, MessageType, ProcessorError, ReconnectConfig, RetiredIdsConfig, SocketError,
    TransportError, TransportResult,
};
pub use ipc::{
    channel_pair, ChannelPeer, Connection, ConnectionState, ConnectionStats, InboundHandler,
    MessageSocket, Replier, SocketEvent, SocketFactory, TcpSocketFactory,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
