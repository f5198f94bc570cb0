//! Remote side of a gzip+JSON stream.
//!
//! Provides:
//! - `AbortRegistry` - Stream id to abort capability, cleaned up on every outcome
//! - `GzippedJsonStream` - Live stream object revived from a wire handle
//! - `Dispatcher` - Named operations with handle revival and built-in `abortStream`

pub mod dispatch;
pub mod registry;
pub mod stream;

use gzstream_core::{StreamId, TransportError};
use thiserror::Error;

pub use dispatch::{DispatchError, Dispatcher, RemoteArg, RemoteArgs};
pub use registry::{AbortRegistry, Registration};
pub use stream::GzippedJsonStream;

/// Receive error.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The sender abandoned the stream before it completed.
    #[error("Stream {stream_id} aborted by sender")]
    Aborted { stream_id: StreamId },
    #[error("Stream {0} is already being received")]
    AlreadyReceiving(StreamId),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Decode error: {0}")]
    Decode(#[from] std::io::Error),
}

impl ReceiveError {
    /// Whether the sender gave up, as opposed to a failure.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}
