//! Error types for the relay.

use crate::types::EventId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Event id {got} on channel {channel} does not follow {previous}")]
    OutOfOrder {
        channel: String,
        previous: EventId,
        got: EventId,
    },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Published events are only recorded in test mode")]
    TestModeDisabled,

    #[error("No channels to subscribe to")]
    NoChannels,

    #[error("Session closed: {0}")]
    SessionClosed(CloseReason),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RelayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RelayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RelayError::Deserialization(e.to_string())
    }
}

/// Why a session stopped delivering events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Cancelled by the owner (client disconnect, shutdown).
    Cancelled,
    /// Live buffer overflowed; the client should reconnect with its last id.
    Lagged,
    /// The downstream sink refused a delivery.
    SinkClosed,
    /// Replay failed against the backing store.
    Failed(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Cancelled => write!(f, "cancelled"),
            CloseReason::Lagged => write!(f, "live buffer overflowed"),
            CloseReason::SinkClosed => write!(f, "sink closed"),
            CloseReason::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
