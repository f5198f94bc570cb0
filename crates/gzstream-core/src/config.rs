//! Coordinator configuration.

use serde::{Deserialize, Serialize};

use crate::ABORT_STREAM_OPERATION;

/// Gzip compression level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Fastest compression, larger output.
    Fastest,
    /// Balanced level.
    #[default]
    Optimal,
    /// Gzip framing without compression.
    NoCompression,
}

impl CompressionLevel {
    #[must_use]
    pub fn to_flate2(self) -> flate2::Compression {
        match self {
            Self::Fastest => flate2::Compression::fast(),
            Self::Optimal => flate2::Compression::default(),
            Self::NoCompression => flate2::Compression::none(),
        }
    }
}

/// JSON text layout of the payload before compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonFormat {
    #[default]
    Compact,
    Pretty,
}

/// Settings supplied at coordinator construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Compression level for outgoing payloads.
    pub compression: CompressionLevel,
    /// Serialization layout.
    pub json: JsonFormat,
    /// Remote operation notified when an active stream is abandoned.
    pub abort_operation: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            compression: CompressionLevel::default(),
            json: JsonFormat::default(),
            abort_operation: ABORT_STREAM_OPERATION.to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Override the compression level.
    #[must_use]
    pub const fn with_compression(mut self, compression: CompressionLevel) -> Self {
        self.compression = compression;
        self
    }

    /// Override the JSON layout.
    #[must_use]
    pub const fn with_json(mut self, json: JsonFormat) -> Self {
        self.json = json;
        self
    }

    /// Override the abort operation name.
    #[must_use]
    pub fn with_abort_operation<S: Into<String>>(mut self, operation: S) -> Self {
        self.abort_operation = operation.into();
        self
    }
}
