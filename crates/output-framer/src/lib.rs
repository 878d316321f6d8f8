//! Output Framer
//!
//! Wraps completed events and command responses in the fixed packet
//! envelope and streams them through the active transport, chunked to the
//! transport's maximum transfer unit with a bounded wait for readiness
//! between chunks.

mod framer;
mod transport;

pub use framer::{OutputFramer, ResponseKind, ENVELOPE_MARKER, ENVELOPE_TRAILER, EVENT_RESPONSE};
pub use transport::{MemoryTransport, Transport, TransportError};
