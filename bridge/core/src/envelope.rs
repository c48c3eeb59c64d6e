//! Message Envelope
//!
//! The immutable unit of one delivery: sender, recipient, payload, id and
//! creation time. The Bridge builds one envelope per `send` and hands the
//! same envelope to every retry and fallback attempt, so a deduplicating
//! listener sees the same id however many times the message lands.
//!
//! # Wire Format
//!
//! One line of JSON. Transports that materialise the envelope (pipe write,
//! drop file, inbox file) write exactly this line.
//!
//! ```text
//! {"id":"…","from":"coordinator","to":"worker-1","payload":"{\"action\":\"ping\"}","timestamp":"2026-…Z"}
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// Envelope identifier
///
/// Caller-supplied or generated as a UUID v4.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub String);

impl EnvelopeId {
    /// Generate a new unique envelope ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EnvelopeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EnvelopeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What the caller wants delivered
///
/// The Bridge is payload-agnostic: structured values are serialised to
/// compact JSON before they reach a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Raw text, delivered as-is
    Text(String),
    /// Structured value, serialised to JSON text
    Structured(serde_json::Value),
}

impl Payload {
    /// Serialise into the text form transports carry
    pub fn into_wire(self) -> Result<String, TransportError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Structured(value) => serde_json::to_string(&value)
                .map_err(|e| TransportError::Serialization(e.to_string())),
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

/// One delivery
///
/// Fields are private; an envelope is never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    from: String,
    to: String,
    payload: String,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(
        id: Option<EnvelopeId>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.unwrap_or_default(),
            from: from.into(),
            to: to.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    /// Envelope id
    #[must_use]
    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    /// Sender label (caller metadata, not authenticated)
    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Recipient identity
    #[must_use]
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Serialised payload text
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Creation time
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Parse the payload as JSON, if it is JSON
    #[must_use]
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.payload).ok()
    }

    /// Encode as a single JSON line (no trailing newline)
    pub fn to_line(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    /// Decode a line produced by [`Envelope::to_line`]
    pub fn from_line(line: &str) -> Result<Self, TransportError> {
        serde_json::from_str(line.trim()).map_err(|e| TransportError::Serialization(e.to_string()))
    }
}
