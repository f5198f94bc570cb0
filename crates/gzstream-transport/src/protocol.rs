//! Wire protocol between the streaming server and its client.
//!
//! Frames are JSON text tagged by `type`; stream bytes travel base64 encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from client (receiver) to server (sender).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start pulling the bytes of a stream.
    Pull { stream: u64 },
    /// Stop pulling a stream before its end.
    Close { stream: u64 },
    /// Successful result of an invoke.
    Reply { call_id: u64, result: Value },
    /// Failed invoke.
    Fault { call_id: u64, message: String },
}

/// Message from server (sender) to client (receiver).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Invoke a remote operation and expect a reply.
    Invoke {
        call_id: u64,
        operation: String,
        args: Vec<Value>,
    },
    /// Invoke a remote operation without a reply.
    Notify { operation: String, args: Vec<Value> },
    /// Stream bytes (base64 encoded).
    Chunk { stream: u64, data: String },
    /// Stream completed.
    End { stream: u64 },
    /// Stream truncated by the sender.
    Reset { stream: u64 },
}

impl ServerMessage {
    /// Create a chunk message from raw bytes.
    #[must_use]
    pub fn chunk(stream: u64, data: &[u8]) -> Self {
        Self::Chunk {
            stream,
            data: BASE64.encode(data),
        }
    }

    /// Decode chunk data from base64.
    #[must_use]
    pub fn decode_chunk(&self) -> Option<Vec<u8>> {
        if let Self::Chunk { data, .. } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}
