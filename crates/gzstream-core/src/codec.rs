//! In-memory gzip+JSON codec.
//!
//! Serialization writes straight through the gzip encoder, so a payload is
//! never held twice in uncompressed form. Every write observes the session's
//! cancellation token and bails out as soon as it fires.

use std::io::{self, BufWriter, Cursor, Write};

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::{CoordinatorConfig, JsonFormat, StreamError};

const WRITE_BUFFER: usize = 64 * 1024;

/// Gzip-compressed JSON encoding of one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPayload {
    bytes: Bytes,
}

impl CompressedPayload {
    #[must_use]
    pub const fn from_bytes(bytes: Bytes) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Sequential reader positioned at the start of the buffer.
    #[must_use]
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.bytes.as_ref())
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Writer that refuses further bytes once the token is cancelled.
struct CancellableWriter<'a, W> {
    inner: W,
    cancel: &'a CancellationToken,
}

impl<W: Write> Write for CancellableWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            // Not `Interrupted`: `write_all` would retry that forever.
            return Err(io::Error::other("compression cancelled"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Serialize `payload` to JSON through a gzip encoder, entirely in memory.
///
/// Output is deterministic for identical payloads and settings.
///
/// # Errors
/// Returns `StreamError::Cancelled` if `cancel` fires before the buffer is
/// complete, or a serialization/compression error.
pub fn compress<P>(
    payload: &P,
    config: &CoordinatorConfig,
    cancel: &CancellationToken,
) -> Result<CompressedPayload, StreamError>
where
    P: Serialize + ?Sized,
{
    let encoder = GzEncoder::new(Vec::new(), config.compression.to_flate2());
    let mut writer = CancellableWriter {
        inner: BufWriter::with_capacity(WRITE_BUFFER, encoder),
        cancel,
    };

    let written = match config.json {
        JsonFormat::Compact => serde_json::to_writer(&mut writer, payload),
        JsonFormat::Pretty => serde_json::to_writer_pretty(&mut writer, payload),
    };
    if let Err(e) = written {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        return Err(if e.is_io() {
            StreamError::Compression(e.into())
        } else {
            StreamError::Serialize(e)
        });
    }

    if cancel.is_cancelled() {
        return Err(StreamError::Cancelled);
    }

    let encoder = writer
        .inner
        .into_inner()
        .map_err(io::IntoInnerError::into_error)?;
    let bytes = encoder.finish()?;

    tracing::trace!(compressed_bytes = bytes.len(), "payload compressed");
    Ok(CompressedPayload::from_bytes(Bytes::from(bytes)))
}

/// Incremental gzip decoder feeding a JSON parse on completion.
pub struct GzipJsonDecoder {
    inner: GzDecoder<Vec<u8>>,
    compressed_bytes: usize,
}

impl Default for GzipJsonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipJsonDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: GzDecoder::new(Vec::new()),
            compressed_bytes: 0,
        }
    }

    /// Feed the next compressed chunk.
    ///
    /// # Errors
    /// Returns error if the chunk is not valid gzip data.
    pub fn push(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.compressed_bytes += chunk.len();
        self.inner.write_all(chunk)
    }

    /// Total compressed bytes consumed so far.
    #[must_use]
    pub const fn compressed_bytes(&self) -> usize {
        self.compressed_bytes
    }

    /// Finish the gzip stream and parse the decompressed JSON.
    ///
    /// # Errors
    /// Returns error on a truncated gzip stream or invalid JSON.
    pub fn finish<T: DeserializeOwned>(self) -> io::Result<T> {
        let decompressed = self.inner.finish()?;
        serde_json::from_slice(&decompressed).map_err(io::Error::from)
    }
}

/// Decompress and parse a complete buffer.
///
/// # Errors
/// Returns error on invalid gzip data or invalid JSON.
pub fn decompress<T: DeserializeOwned>(data: &[u8]) -> io::Result<T> {
    let mut decoder = GzipJsonDecoder::new();
    decoder.push(data)?;
    decoder.finish()
}
