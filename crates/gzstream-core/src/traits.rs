//! Core traits for moving bytes and calls across the boundary.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::{CompressedPayload, TransportError};

/// Raw compressed bytes as the receiver pulls them.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Ownership of an opened outgoing stream.
///
/// Dropping the lease tells the transport the sender no longer cares about
/// the stream: unpulled buffers are released and a stream still flowing is
/// truncated on the receiver side.
pub struct StreamLease {
    reference: Value,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamLease {
    /// Create a lease that runs `release` when dropped.
    pub fn new<F>(reference: Value, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            reference,
            release: Some(Box::new(release)),
        }
    }

    /// Lease with no release action.
    #[must_use]
    pub const fn detached(reference: Value) -> Self {
        Self {
            reference,
            release: None,
        }
    }

    /// The transport's native reference to embed in the wire handle.
    #[must_use]
    pub const fn reference(&self) -> &Value {
        &self.reference
    }
}

impl fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Sender side of the boundary.
///
/// Implement this trait to plug a concrete RPC or interop channel under the
/// coordinator.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand a compressed payload to the transport.
    ///
    /// The transport owns the buffer from here on and releases it once the
    /// receiver has drained it or the returned lease is dropped.
    fn open_stream(&self, payload: CompressedPayload) -> Result<StreamLease, TransportError>;

    /// Invoke a remote operation and await its result.
    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, TransportError>;

    /// Invoke a remote operation without waiting for a result.
    async fn notify(&self, operation: &str, args: Vec<Value>) -> Result<(), TransportError>;
}

/// Receiver side: resolves a native stream reference into its bytes.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Start pulling the stream behind `reference`.
    ///
    /// Dropping the returned stream before it ends signals abandonment back
    /// to the sender.
    async fn open(&self, reference: &Value) -> Result<ByteStream, TransportError>;
}
