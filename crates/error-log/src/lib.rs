//! Bounded fault log
//!
//! Faults anywhere in the acquisition pipeline are recorded here instead of
//! propagating as errors; every fault site has a local recovery that keeps
//! the pipeline moving. The log holds at most 64 records per fill cycle,
//! drops anything beyond that, and empties atomically when drained by the
//! read-errors command.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum records held between drains.
pub const LOG_CAPACITY: usize = 64;

/// Fault codes, stable on the wire: the read-errors response reports these
/// numeric values to the ground system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultCode {
    /// Threshold DAC load failed
    DacLoad = 1,
    /// Threshold DAC readback failed
    DacRead = 2,
    /// Timing-discriminator DAC load failed
    TofDacLoad = 3,
    /// Timing-discriminator DAC readback failed
    TofDacRead = 4,
    /// Command received while the trigger was enabled
    CommandIgnored = 5,
    /// Detector link byte read timed out
    DetectorReadTimeout = 6,
    /// Unrecognized detector packet type
    DetectorBadId = 7,
    /// Detector packet length mismatch
    DetectorBadLength = 8,
    /// Detector command echo mismatch
    DetectorBadEcho = 9,
    /// Detector packet read failed
    DetectorReadFailed = 10,
    /// Detector board address out of range
    DetectorBadFpga = 11,
    /// Housekeeping trailer byte wrong
    DetectorBadTrailer = 12,
    /// Housekeeping data count inconsistent
    DetectorBadDataCount = 13,
    /// Analog conversion never completed
    AnalogTimeout = 14,
    /// Declared board count differs from configuration
    DetectorBoardCount = 15,
    /// Hit-list identifier byte wrong
    DetectorBadBoardId = 16,
    /// Hit list shorter than the minimum
    DetectorBoardShort = 17,
    /// Serial transmit never drained
    TxFailed = 19,
    /// Command frame failed the redundancy vote
    BadCommand = 20,
    /// Assembled event exceeded the output buffer
    EventTooBig = 21,
    /// Data byte arrived out of order or with index zero
    BadDataByte = 22,
    /// Detector status poll returned an unknown code
    DetectorBadStatus = 23,
    /// Detector trigger-enable handshake failed
    DetectorTriggerEnable = 24,
    /// Trigger-primitive header carried the wrong board address
    DetectorBadTriggerHeader = 25,
    /// Hit list longer than a board is allowed to send
    DetectorHitsTooBig = 26,
    /// Boards read out in the wrong order
    DetectorBoardOrder = 27,
    /// Packet type other than the one requested
    DetectorWrongType = 28,
    /// Command block queue overflowed
    CommandOverflow = 29,
}

/// One fault occurrence: a code plus two site-specific byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: FaultCode,
    pub value0: u8,
    pub value1: u8,
}

/// Bounded append-only fault log, shared between the interrupt-side
/// producers and the main loop.
pub struct ErrorLog {
    records: Mutex<Vec<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::with_capacity(LOG_CAPACITY)),
        }
    }

    /// Append one record. Silently dropped once the log is full; records
    /// are never overwritten within a fill cycle.
    pub fn record(&self, code: FaultCode, value0: u8, value1: u8) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() < LOG_CAPACITY {
            records.push(ErrorRecord {
                code,
                value0,
                value1,
            });
        }
        warn!(?code, value0, value1, "fault recorded");
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every record and leave the log empty, atomically with respect
    /// to concurrent `record` calls.
    pub fn drain(&self) -> Vec<ErrorRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *records)
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}
