//! Single-flight streaming of compressed payloads to a remote peer.
//!
//! Provides:
//! - `StreamCoordinator` - Supersede, compress, transmit and forward aborts

pub mod coordinator;

pub use coordinator::StreamCoordinator;
