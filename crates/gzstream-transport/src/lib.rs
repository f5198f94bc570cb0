//! Transport layer for gzip+JSON streams.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - In-process loopback link (feature: loopback)

pub mod protocol;

#[cfg(feature = "loopback")]
pub mod loopback;

#[cfg(feature = "loopback")]
pub use loopback::{LinkOptions, LoopbackTransport, connect};
pub use protocol::{ClientMessage, ServerMessage};
