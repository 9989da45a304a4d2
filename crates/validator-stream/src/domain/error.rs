//! Error taxonomy for the validator stream.
//!
//! Transport failures (`TransportError` and the codec errors it wraps) describe
//! what happened to a request on its way to or from the validator. Application
//! failures (`ApplicationError`) travel inside a successfully delivered reply
//! and are never produced by the transport itself.

use crate::domain::correlation::CorrelationId;
use bytes::Bytes;

/// Envelope could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(i32),

    #[error("correlation id must not be empty")]
    EmptyCorrelationId,
}

/// Inbound bytes are not a well-formed envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodingError {
    #[error("buffer truncated while reading {0}")]
    Truncated(&'static str),

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("unsupported wire type {wire_type} for field {field}")]
    UnsupportedWireType { field: u64, wire_type: u8 },

    #[error("field number 0 is not valid")]
    InvalidFieldNumber,

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("correlation id is missing or empty")]
    MissingCorrelationId,

    #[error("correlation id is not valid UTF-8")]
    InvalidCorrelationId,
}

/// Failures reported by a socket implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("socket is not open")]
    NotOpen,

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("no async runtime available to drive the socket")]
    NoRuntime,
}

/// Failures surfaced to callers of the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// `call` before `connect` was ever invoked.
    #[error("must call `connect` before sending requests")]
    NotConnected,

    /// The connection dropped while the request was outstanding.
    #[error("the connection to the validator was lost")]
    ConnectionLost,

    /// The connection was closed by its owner.
    #[error("the connection was closed")]
    Closed,

    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },

    #[error("`connect` was already called on this connection")]
    AlreadyConnected,

    #[error("an inbound handler is already registered")]
    HandlerAlreadyRegistered,

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Decoding(#[from] DecodingError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl TransportError {
    /// True for failures caused by losing or never having a connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected | TransportError::ConnectionLost | TransportError::Closed
        )
    }
}

/// Failures carried in a reply payload's error channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplicationError {
    /// The request itself is invalid and must not be retried.
    #[error("invalid transaction: {message}")]
    InvalidTransaction {
        message: String,
        extended_data: Option<Bytes>,
    },
    /// The handler hit an internal fault; the request may be retried.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        extended_data: Option<Bytes>,
    },
    /// The handler tried to touch something it is not authorised for.
    #[error("authorization error: {message}")]
    Authorization { message: String },
}

impl ApplicationError {
    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        ApplicationError::InvalidTransaction {
            message: message.into(),
            extended_data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApplicationError::Internal {
            message: message.into(),
            extended_data: None,
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        ApplicationError::Authorization {
            message: message.into(),
        }
    }

    /// Attach application-specific bytes returned to the submitter.
    ///
    /// Authorization failures carry no extended data; the call is a no-op for them.
    pub fn with_extended_data(mut self, data: impl Into<Bytes>) -> Self {
        match &mut self {
            ApplicationError::InvalidTransaction { extended_data, .. }
            | ApplicationError::Internal { extended_data, .. } => {
                *extended_data = Some(data.into());
            }
            ApplicationError::Authorization { .. } => {}
        }
        self
    }

    pub fn message(&self) -> &str {
        match self {
            ApplicationError::InvalidTransaction { message, .. }
            | ApplicationError::Internal { message, .. }
            | ApplicationError::Authorization { message } => message,
        }
    }

    pub fn extended_data(&self) -> Option<&Bytes> {
        match self {
            ApplicationError::InvalidTransaction { extended_data, .. }
            | ApplicationError::Internal { extended_data, .. } => extended_data.as_ref(),
            ApplicationError::Authorization { .. } => None,
        }
    }
}

/// Either family of failure, for handler code that talks to the validator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Application(#[from] ApplicationError),
}

/// Invalid connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("validator url must not be empty")]
    EmptyUrl,

    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),

    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        assert!(TransportError::NotConnected.is_connection_error());
        assert!(TransportError::ConnectionLost.is_connection_error());
        assert!(TransportError::Closed.is_connection_error());
        assert!(!TransportError::Encoding(EncodingError::EmptyCorrelationId).is_connection_error());
    }

    #[test]
    fn test_timeout_message_names_request() {
        let id = CorrelationId::parse("abc").unwrap();
        let err = TransportError::Timeout {
            correlation_id: id,
            timeout_ms: 50,
        };
        assert_eq!(err.to_string(), "request abc timed out after 50ms");
    }

    #[test]
    fn test_extended_data() {
        let err = ApplicationError::invalid_transaction("bad payload")
            .with_extended_data(Bytes::from_static(b"\x01\x02"));
        assert_eq!(err.message(), "bad payload");
        assert_eq!(err.extended_data().map(|b| b.as_ref()), Some(&b"\x01\x02"[..]));

        let auth = ApplicationError::authorization("denied").with_extended_data(vec![1u8]);
        assert!(auth.extended_data().is_none());
    }

    #[test]
    fn test_application_errors_are_distinct_from_transport() {
        let err: ProcessorError = ApplicationError::internal("boom").into();
        assert!(matches!(err, ProcessorError::Application(_)));
        assert_eq!(err.to_string(), "internal error: boom");

        let err: ProcessorError = TransportError::ConnectionLost.into();
        assert!(matches!(err, ProcessorError::Transport(_)));
    }

    #[test]
    fn test_application_error_display() {
        assert_eq!(
            ApplicationError::invalid_transaction("nonce reused").to_string(),
            "invalid transaction: nonce reused"
        );
        assert_eq!(
            ApplicationError::authorization("address 1cf1").to_string(),
            "authorization error: address 1cf1"
        );

        let err: Box<dyn std::error::Error> = Box::new(ApplicationError::internal("db"));
        assert_eq!(err.to_string(), "internal error: db");
    }
}
