//! Live stream object revived from a wire handle.

use std::{fmt, sync::Arc};

use futures::StreamExt;
use gzstream_core::{
    GzipJsonDecoder, StreamHandleRef, StreamId, StreamSource, TransportError,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{AbortRegistry, ReceiveError};

/// Incoming compressed JSON stream.
///
/// [`get_data`](Self::get_data) consumes the object, so each stream resolves
/// exactly once: completed, aborted or errored.
pub struct GzippedJsonStream {
    handle: StreamHandleRef,
    source: Arc<dyn StreamSource>,
    registry: Arc<AbortRegistry>,
}

impl fmt::Debug for GzippedJsonStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GzippedJsonStream")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl GzippedJsonStream {
    #[must_use]
    pub fn new(
        handle: StreamHandleRef,
        source: Arc<dyn StreamSource>,
        registry: Arc<AbortRegistry>,
    ) -> Self {
        Self {
            handle,
            source,
            registry,
        }
    }

    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.handle.stream_id
    }

    /// Pull, decompress and parse the whole stream.
    ///
    /// The stream stays registered for abort only while this runs.
    ///
    /// # Errors
    /// Returns `ReceiveError::Aborted` if the sender abandoned the stream,
    /// otherwise the transport or decode failure.
    pub async fn get_data<T: DeserializeOwned>(self) -> Result<T, ReceiveError> {
        let id = self.id();
        let registration = self.registry.register(id)?;
        tracing::debug!(stream_id = %id, "receiving stream");

        let outcome = self.receive(registration.token()).await;
        drop(registration);

        match &outcome {
            Ok(_) => tracing::debug!(stream_id = %id, "stream received"),
            Err(ReceiveError::Aborted { .. }) => {
                tracing::info!(stream_id = %id, "stream aborted by sender");
            }
            Err(e) => tracing::warn!(stream_id = %id, "stream receive failed: {e}"),
        }
        outcome
    }

    async fn receive<T: DeserializeOwned>(
        &self,
        abort: &CancellationToken,
    ) -> Result<T, ReceiveError> {
        let id = self.id();

        let opened = tokio::select! {
            biased;
            () = abort.cancelled() => return Err(ReceiveError::Aborted { stream_id: id }),
            opened = self.source.open(&self.handle.reference) => opened,
        };
        let mut bytes = opened.map_err(|e| classify(id, e))?;

        let mut decoder = GzipJsonDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                () = abort.cancelled() => return Err(ReceiveError::Aborted { stream_id: id }),
                next = bytes.next() => next,
            };
            match next {
                Some(Ok(chunk)) => decoder.push(&chunk)?,
                Some(Err(e)) => return Err(classify(id, e)),
                None => break,
            }
        }

        tracing::trace!(
            stream_id = %id,
            compressed_bytes = decoder.compressed_bytes(),
            "stream drained"
        );
        Ok(decoder.finish()?)
    }
}

/// A sender-side reset is an abort, not a transport failure.
fn classify(id: StreamId, error: TransportError) -> ReceiveError {
    match error {
        TransportError::StreamReset => ReceiveError::Aborted { stream_id: id },
        other => ReceiveError::Transport(other),
    }
}
