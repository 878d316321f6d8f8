//! Byte-oriented serial port seam
//!
//! The detector link and the command input both run over ports with this
//! shape. Reads are non-blocking; the protocol layers wrap them in bounded
//! tick-polling loops so nothing in the core ever blocks.

use std::sync::Arc;

use thiserror::Error;

/// Serial port error types
#[derive(Debug, Error)]
pub enum PortError {
    /// The peer side of the port is gone
    #[error("port closed")]
    Closed,

    /// The transmit queue cannot take more bytes
    #[error("transmit queue full")]
    TxFull,
}

/// A full-duplex byte port.
pub trait SerialPort: Send + Sync {
    /// Pop one received byte if any is waiting.
    fn try_read(&self) -> Option<u8>;

    /// Queue one byte for transmission.
    fn write(&self, byte: u8) -> Result<(), PortError>;

    /// Number of bytes still waiting in the transmit queue.
    fn tx_pending(&self) -> usize;

    /// Discard everything in the receive queue.
    fn clear_rx(&self);
}

/// Shared handle to a serial port.
pub type SharedPort = Arc<dyn SerialPort>;
