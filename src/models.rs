//! Data models for the bridge wire protocol.
//!
//! These Rust structs match the message format spoken by the Python worker's
//! message broker. They use serde for JSON (de)serialization on the wire.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of hex characters in a generated correlation token.
const CORRELATION_ID_LEN: usize = 8;

/// Message kind enum.
///
/// Matches the worker's `MessageType` values exactly for serde compatibility.
/// Includes `Unknown` variant for forward-compatibility with new kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "CMD")]
    Command,
    #[serde(rename = "RESP")]
    Response,
    #[serde(rename = "EVENT")]
    Event,
    #[serde(rename = "ERR")]
    Error,
    /// Forward-compatible fallback for unknown kinds
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Get the wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "CMD",
            MessageKind::Response => "RESP",
            MessageKind::Event => "EVENT",
            MessageKind::Error => "ERR",
            MessageKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token pairing a command with its eventual reply.
///
/// Unsolicited peer frames may carry an empty token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a short random token (first 8 hex chars of a UUID v4).
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(CORRELATION_ID_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure to extract a typed value from a message payload.
#[derive(Debug, Error)]
#[error("Invalid payload for {scope}.{operation}: {source}")]
pub struct PayloadError {
    pub scope: String,
    pub operation: String,
    #[source]
    pub source: serde_json::Error,
}

/// The unit of exchange between the front end and the worker.
///
/// Field order is the wire order: `type, module, action, data, msg_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Logical subsystem (worker module name).
    #[serde(rename = "module", default)]
    pub scope: String,
    /// Action within the scope.
    #[serde(rename = "action", default)]
    pub operation: String,
    /// Opaque payload, passed through untouched.
    #[serde(rename = "data", default)]
    pub payload: serde_json::Value,
    #[serde(rename = "msg_id", default)]
    pub correlation_id: CorrelationId,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        scope: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            kind,
            scope: scope.into(),
            operation: operation.into(),
            payload,
            correlation_id,
        }
    }

    /// Build an outbound command with a freshly generated token.
    pub fn command(
        scope: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            MessageKind::Command,
            scope,
            operation,
            payload,
            CorrelationId::generate(),
        )
    }

    /// Build a response echoing `correlation_id`.
    pub fn response(
        scope: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
    ) -> Self {
        Self::new(MessageKind::Response, scope, operation, payload, correlation_id)
    }

    /// Build an unsolicited event.
    pub fn event(
        scope: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            MessageKind::Event,
            scope,
            operation,
            payload,
            CorrelationId::generate(),
        )
    }

    /// `scope.operation`, as used in log lines and error messages.
    pub fn route(&self) -> String {
        format!("{}.{}", self.scope, self.operation)
    }

    /// Deserialize the payload into a scope-specific type.
    ///
    /// Missing or wrong-shaped fields are reported as a `PayloadError`
    /// instead of panicking, so callers can surface them as a bad reply.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        T::deserialize(&self.payload).map_err(|source| PayloadError {
            scope: self.scope.clone(),
            operation: self.operation.clone(),
            source,
        })
    }

    /// Look up a single top-level payload field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }
}
