//! Correlation ID for request/response matching.
//!
//! Locally issued ids are the hex SHA-256 digest of a random UUID v4. Ids
//! chosen by the validator are treated as opaque non-empty strings.

use crate::domain::error::EncodingError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Correlation ID linking a request to its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a fresh id for an outbound request.
    pub fn generate() -> Self {
        let digest = Sha256::digest(Uuid::new_v4().as_bytes());
        Self(hex::encode(digest).into())
    }

    /// Accept an id chosen by someone else (usually the validator).
    pub fn parse(s: impl Into<String>) -> Result<Self, EncodingError> {
        let s = s.into();
        if s.is_empty() {
            return Err(EncodingError::EmptyCorrelationId);
        }
        Ok(Self(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = EncodingError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for CorrelationId {
    type Error = EncodingError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0.to_string()
    }
}
