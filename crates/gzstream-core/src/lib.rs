//! Core abstractions for single-flight gzip+JSON streaming.
//!
//! This crate provides the fundamental building blocks:
//! - `StreamId` - Correlation key between a sender session and its remote abort registration
//! - `StreamHandleRef` - Tagged wire value the receiver revives into a live stream
//! - `codec` - In-memory gzip+JSON compression with cooperative cancellation
//! - `CoordinatorConfig` - Compression and serialization settings
//! - Transport and stream-source traits

pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod traits;

pub use codec::{CompressedPayload, GzipJsonDecoder};
pub use config::{CompressionLevel, CoordinatorConfig, JsonFormat};
pub use error::{StreamError, TransportError};
pub use handle::{ABORT_STREAM_OPERATION, STREAM_MARKER_KEY, StreamHandleRef, StreamId};
pub use traits::{ByteStream, StreamLease, StreamSource, Transport};
