//! Stream identifiers and the tagged wire value carrying them.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TransportError;

/// Reserved key marking a JSON object as a stream handle.
pub const STREAM_MARKER_KEY: &str = "__gzippedJsonStream";

/// Remote operation invoked to abandon an in-flight stream.
pub const ABORT_STREAM_OPERATION: &str = "abortStream";

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one stream session.
///
/// Identifiers are process-wide, so several coordinators can share one
/// receiver without colliding in its abort registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw identifier received from the wire.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tagged handle passed as the first argument of a streamed remote call.
///
/// Serializes as `{"__gzippedJsonStream": <id>, "ref": <transport reference>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHandleRef {
    #[serde(rename = "__gzippedJsonStream")]
    pub stream_id: StreamId,
    /// The transport's native streaming reference.
    #[serde(rename = "ref")]
    pub reference: Value,
}

impl StreamHandleRef {
    #[must_use]
    pub const fn new(stream_id: StreamId, reference: Value) -> Self {
        Self {
            stream_id,
            reference,
        }
    }

    /// Encode as a JSON argument value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = serde_json::Map::with_capacity(2);
        object.insert(STREAM_MARKER_KEY.to_string(), Value::from(self.stream_id.0));
        object.insert("ref".to_string(), self.reference.clone());
        Value::Object(object)
    }

    /// Recognize a handle by its marker key.
    ///
    /// Returns `Ok(None)` for ordinary values.
    ///
    /// # Errors
    /// Returns error if the marker is present but the object is malformed.
    pub fn detect(value: &Value) -> Result<Option<Self>, TransportError> {
        match value.as_object() {
            Some(object) if object.contains_key(STREAM_MARKER_KEY) => {
                Self::deserialize(value)
                    .map(Some)
                    .map_err(|e| TransportError::Protocol(format!("malformed stream handle: {e}")))
            }
            _ => Ok(None),
        }
    }
}
