//! Error taxonomy shared by sender and receiver.

use thiserror::Error;

/// Failure of the underlying byte transport or remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Link closed")]
    LinkClosed,
    #[error("Remote fault: {0}")]
    Remote(String),
    #[error("Stream reset by sender")]
    StreamReset,
    #[error("Unknown stream reference: {0}")]
    UnknownStream(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Outcome of a send that did not produce a result.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Session superseded, cancelled or its coordinator disposed.
    #[error("Operation cancelled")]
    Cancelled,
    /// The coordinator was disposed before this send was issued.
    #[error("Coordinator disposed")]
    Disposed,
    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("Serialization failed: {0}")]
    Serialize(serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Result decode failed: {0}")]
    Decode(serde_json::Error),
    #[error("Session task failed: {0}")]
    TaskFailed(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Whether this outcome means "cancelled" rather than "failed".
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
