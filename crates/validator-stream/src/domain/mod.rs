//! Domain types for the validator stream.
//!
//! Pure types only: message kinds, envelopes, correlation ids, errors and
//! configuration. Async machinery lives in `crate::ipc`.

pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod message_type;

// Re-exports for convenience
pub use config::{ConnectionConfig, ReconnectConfig, RetiredIdsConfig};
pub use correlation::CorrelationId;
pub use envelope::Envelope;
pub use error::{
    ApplicationError, ConfigError, DecodingError, EncodingError, ProcessorError, SocketError,
    TransportError, TransportResult,
};
pub use message_type::MessageType;
