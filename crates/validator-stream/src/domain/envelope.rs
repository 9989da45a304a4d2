//! The three-field unit exchanged with the validator.

use crate::domain::correlation::CorrelationId;
use crate::domain::message_type::MessageType;
use bytes::Bytes;

/// Immutable envelope: message kind, correlation id and opaque content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    message_type: MessageType,
    correlation_id: CorrelationId,
    content: Bytes,
}

impl Envelope {
    pub fn new(
        message_type: MessageType,
        correlation_id: CorrelationId,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_type,
            correlation_id,
            content: content.into(),
        }
    }

    /// Build a reply that reuses this envelope's correlation id.
    pub fn reply(&self, message_type: MessageType, content: impl Into<Bytes>) -> Self {
        Self::new(message_type, self.correlation_id.clone(), content)
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Split into owned parts.
    pub fn into_parts(self) -> (MessageType, CorrelationId, Bytes) {
        (self.message_type, self.correlation_id, self.content)
    }
}
