//! Packet envelope and chunked streaming

use std::sync::Arc;

use tracing::debug;

use board_hal::{Clock, SharedClock, Tick};
use error_log::{ErrorLog, FaultCode};

use crate::transport::Transport;

/// Envelope header marker.
pub const ENVELOPE_MARKER: u8 = 0xDC;

/// Response-type byte for an unsolicited event record.
pub const EVENT_RESPONSE: u8 = 0xDD;

/// Envelope trailer.
pub const ENVELOPE_TRAILER: [u8; 3] = [0xFF, 0x00, 0xFF];

/// Alignment padding bytes, at most two of them.
const PADDING: [u8; 2] = [0x01, 0x02];

/// Fault-site tag for a stalled transport.
const STALL_TAG: u8 = 0xFD;

/// What the envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// An event record going out on its own.
    Event,
    /// The response to the command with this opcode.
    Command(u8),
}

impl ResponseKind {
    fn type_byte(self) -> u8 {
        match self {
            ResponseKind::Event => EVENT_RESPONSE,
            ResponseKind::Command(opcode) => opcode,
        }
    }
}

/// Streams envelopes through a transport with bounded readiness waits.
pub struct OutputFramer {
    clock: SharedClock,
    log: Arc<ErrorLog>,
    /// Ticks to wait for transport readiness between chunks.
    ready_timeout: Tick,
}

impl OutputFramer {
    pub fn new(clock: SharedClock, log: Arc<ErrorLog>) -> Self {
        Self {
            clock,
            log,
            ready_timeout: 200,
        }
    }

    /// Wrap and stream one payload: six-byte header, echoed command data,
    /// payload, padding to a multiple of three, three-byte trailer.
    ///
    /// Returns false if the transport stopped accepting chunks; the fault
    /// is logged and the remainder of the envelope is abandoned.
    pub fn send(
        &self,
        transport: &dyn Transport,
        kind: ResponseKind,
        echo: &[u8],
        payload: &[u8],
    ) -> bool {
        let total = payload.len() + echo.len();
        let padding = (3 - total % 3) % 3;
        let header = [
            ENVELOPE_MARKER,
            0x00,
            0xFF,
            total as u8,
            kind.type_byte(),
            echo.len() as u8,
        ];

        debug!(
            kind = header[4],
            payload = payload.len(),
            echo = echo.len(),
            padding,
            "sending envelope"
        );
        self.stream(transport, &header)
            && self.stream(transport, echo)
            && self.stream(transport, payload)
            && self.stream(transport, &PADDING[..padding])
            && self.stream(transport, &ENVELOPE_TRAILER)
    }

    /// Push bytes in transport-sized chunks, waiting (bounded) for
    /// readiness before each one.
    fn stream(&self, transport: &dyn Transport, bytes: &[u8]) -> bool {
        for chunk in bytes.chunks(transport.max_chunk().max(1)) {
            if !self.wait_ready(transport) {
                return false;
            }
            if transport.write(chunk).is_err() {
                self.log.record(FaultCode::TxFailed, chunk[0], STALL_TAG);
                return false;
            }
        }
        true
    }

    fn wait_ready(&self, transport: &dyn Transport) -> bool {
        let start = self.clock.now();
        while !transport.ready() {
            if self.clock.now().wrapping_sub(start) > self.ready_timeout {
                self.log.record(FaultCode::TxFailed, 0x00, STALL_TAG);
                return false;
            }
        }
        true
    }
}
