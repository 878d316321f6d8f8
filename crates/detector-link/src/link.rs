//! Link driver: bounded byte reads, packet parsing, outbound commands

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use board_hal::{Clock, SerialPort, SharedClock, SharedPort, Tick};
use error_log::{ErrorLog, FaultCode};

use crate::arena::{HitArena, MAX_BOARDS, MAX_BOARD_BYTES};
use crate::packet::{
    placeholder, type_code, DetectorEvent, Expected, Housekeeping, HOUSEKEEPING_CAPACITY,
};

/// Detector command codes issued by the board itself.
mod det_cmd {
    /// Read out the event for the current trigger.
    pub const READ_EVENT: u8 = 0x01;
    /// Reset one board's state machines.
    pub const LOGIC_RESET: u8 = 0x04;
    /// Read an ASIC configuration register.
    pub const CONFIG_READ: u8 = 0x22;
    /// Housekeeping status request.
    pub const STATUS: u8 = 0x57;
    /// Start input-timing self calibration.
    pub const CAL_TIMING_START: u8 = 0x81;
    /// Latch the calibrated input delay.
    pub const CAL_TIMING_SET: u8 = 0x82;
}

/// Detector codes that never produce an echo.
pub const ECHO_LESS: [u8; 2] = [0x67, 0x6C];

/// Status-poll payload codes.
const STATUS_READY: u8 = 0x59;
const STATUS_NOT_READY: u8 = 0x4E;

/// Internal outcome codes carried in fault records so the ground system
/// can tell failure sites apart.
pub(crate) mod outcome {
    pub const OK: u8 = 0;
    pub const ECHO_MISMATCH: u8 = 1;
    pub const UNEXPECTED_EVENT: u8 = 53;
    pub const WRONG_TYPE: u8 = 54;
    pub const BAD_LENGTH: u8 = 55;
    pub const BOARD_COUNT: u8 = 56;
    pub const BOARD_SHORT: u8 = 57;
    pub const BAD_BOARD_ID: u8 = 58;
    pub const BAD_FPGA: u8 = 59;
}

/// Link tuning, all timeouts in 5 ms ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Boards expected in every event readout.
    pub board_count: u8,
    /// Wait per inbound byte.
    pub byte_timeout: Tick,
    /// Wait for the transmit queue to drain.
    pub tx_timeout: Tick,
    /// Status polls before giving up on a readout.
    pub status_attempts: u8,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            board_count: 1,
            byte_timeout: 31,
            tx_timeout: 200,
            status_attempts: 10,
        }
    }
}

/// Result of one packet read: an outcome code plus whatever payload bytes
/// belong to the caller (echo and unknown packets; event and housekeeping
/// data land in the link's own state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOutcome {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl PacketOutcome {
    fn ok(payload: Vec<u8>) -> Self {
        Self {
            code: outcome::OK,
            payload,
        }
    }

    fn failed(code: u8) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == outcome::OK
    }
}

/// Driver for the detector front-end serial link.
///
/// Owns the per-cycle readout state: the event header, the hit-list arena,
/// and any pending housekeeping payload. A parse failure at any stage
/// substitutes well-formed placeholder data; the caller always gets a
/// serializable cycle.
pub struct DetectorLink {
    port: SharedPort,
    clock: SharedClock,
    log: Arc<ErrorLog>,
    config: DetectorConfig,
    /// Last command code sent, checked against echoes.
    last_code: u8,
    /// Detector-side command counter from the last echo or housekeeping.
    cmd_count: u16,
    event: DetectorEvent,
    arena: HitArena,
    housekeeping: Option<Housekeeping>,
}

impl DetectorLink {
    pub fn new(
        port: SharedPort,
        clock: SharedClock,
        log: Arc<ErrorLog>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            port,
            clock,
            log,
            config,
            last_code: 0,
            cmd_count: 0,
            event: DetectorEvent::default(),
            arena: HitArena::new(),
            housekeeping: None,
        }
    }

    /// Boards expected per readout.
    pub fn board_count(&self) -> u8 {
        self.config.board_count
    }

    /// Update the expected board count (the detector's own layer-count
    /// command keeps both sides consistent).
    pub fn set_board_count(&mut self, count: u8) {
        self.config.board_count = count.min(MAX_BOARDS as u8);
    }

    pub fn event(&self) -> &DetectorEvent {
        &self.event
    }

    pub fn arena(&self) -> &HitArena {
        &self.arena
    }

    /// Detector-side command counter.
    pub fn cmd_count(&self) -> u16 {
        self.cmd_count
    }

    /// Pending housekeeping payload, if any, leaving none behind.
    pub fn take_housekeeping(&mut self) -> Option<Housekeeping> {
        self.housekeeping.take()
    }

    /// Drop the cycle's hit lists after serialization.
    pub fn clear_cycle(&mut self) {
        self.arena.clear();
        self.event.board_count = 0;
    }

    /// One byte with a bounded wait. Timeout records a fault tagged with
    /// the call site and substitutes zero so parsing can continue.
    fn get_byte(&self, start: Tick, tag: u8) -> u8 {
        loop {
            if let Some(byte) = self.port.try_read() {
                return byte;
            }
            let elapsed = self.clock.now().wrapping_sub(start);
            if elapsed > self.config.byte_timeout {
                self.log
                    .record(FaultCode::DetectorReadTimeout, (elapsed & 0xFF) as u8, tag);
                return 0;
            }
        }
    }

    /// Write one framed command and wait, bounded, for the transmitter to
    /// drain. Returns false after a transmit timeout.
    pub fn write_command(&mut self, fpga: u8, code: u8, data: &[u8], fail_tag: u8) -> bool {
        self.last_code = code;
        let _ = self.port.write(fpga);
        let _ = self.port.write(code);
        let _ = self.port.write(data.len() as u8);
        for &byte in data {
            let _ = self.port.write(byte);
        }

        let start = self.clock.now();
        while self.port.tx_pending() > 0 {
            if self.clock.now().wrapping_sub(start) > self.config.tx_timeout {
                self.log.record(FaultCode::TxFailed, code, fail_tag);
                return false;
            }
        }
        true
    }

    /// Send a command and consume its echo (unless the code is echo-less).
    pub fn send_with_data(&mut self, fpga: u8, code: u8, data: &[u8]) {
        if !self.write_command(fpga, code, data, 0xFF) {
            return;
        }
        if ECHO_LESS.contains(&code) {
            return;
        }
        let echoed = self.read_packet(Expected::Echo);
        if !echoed.is_ok() {
            self.log
                .record(FaultCode::DetectorReadFailed, echoed.code, code);
        }
    }

    /// Send a data-less command and consume its echo.
    pub fn send_simple(&mut self, fpga: u8, code: u8) {
        self.send_with_data(fpga, code, &[]);
    }

    /// Read one packet: length byte, type code, type-specific payload.
    pub fn read_packet(&mut self, expected: Expected) -> PacketOutcome {
        let start = self.clock.now();
        let len = self.get_byte(start, 1);
        let id = self.get_byte(start, 2);

        if id != expected.type_code() {
            match expected {
                Expected::Event => {
                    self.log
                        .record(FaultCode::DetectorWrongType, id, type_code::EVENT);
                    self.synthesize_empty_event(placeholder::TAG_WRONG_TYPE);
                    return PacketOutcome::failed(outcome::WRONG_TYPE);
                }
                Expected::Housekeeping | Expected::Echo => {
                    // Parse whatever actually arrived so the link stays
                    // aligned; the caller sees the failure through the log.
                    self.log
                        .record(FaultCode::DetectorWrongType, id, expected.type_code());
                }
                Expected::Any => {
                    if id == type_code::EVENT {
                        self.log.record(FaultCode::DetectorWrongType, id, 0);
                        return PacketOutcome::failed(outcome::UNEXPECTED_EVENT);
                    }
                }
            }
        }

        match id {
            type_code::EVENT => self.read_event_payload(start, len),
            type_code::HOUSEKEEPING => self.read_housekeeping_payload(start, len),
            type_code::ECHO => self.read_echo_payload(start, len),
            other => self.drain_unknown(start, other, len),
        }
    }

    fn read_event_payload(&mut self, start: Tick, len: u8) -> PacketOutcome {
        if len != 5 {
            self.log
                .record(FaultCode::DetectorBadLength, type_code::EVENT, len);
            self.synthesize_empty_event(placeholder::TAG_BAD_LENGTH);
            return PacketOutcome::failed(outcome::BAD_LENGTH);
        }

        self.event.trigger_count =
            (u16::from(self.get_byte(start, 3)) << 8) | u16::from(self.get_byte(start, 4));
        self.event.cmd_count = self.get_byte(start, 5);
        let packed = self.get_byte(start, 6);
        self.event.pattern = packed & 0xC0;
        let boards = packed & 0x3F;

        if boards != self.config.board_count {
            self.log
                .record(FaultCode::DetectorBoardCount, boards, self.event.pattern);
            self.event.board_count = self.config.board_count;
            self.install_placeholders(placeholder::TAG_BOARD_COUNT);
            return PacketOutcome::failed(outcome::BOARD_COUNT);
        }
        self.event.board_count = boards;

        let mut code = outcome::OK;
        for board in 0..boards {
            let list_len = self.get_byte(start, 7);
            if list_len < 4 {
                self.log
                    .record(FaultCode::DetectorBoardShort, list_len, board);
                self.set_placeholder(board, placeholder::TAG_BOARD_SHORT);
                code = outcome::BOARD_SHORT;
                continue;
            }
            let id_byte = self.get_byte(start, 8);
            if id_byte != placeholder::ID_BYTE {
                self.log
                    .record(FaultCode::DetectorBadBoardId, id_byte, board);
                self.set_placeholder(board, placeholder::TAG_BAD_BOARD_ID);
                code = outcome::BAD_BOARD_ID;
                continue;
            }
            let address = self.get_byte(start, 9);
            // Address 8 denotes the master board, which reads out as layer 0.
            if address > 8 {
                self.log.record(FaultCode::DetectorBadFpga, address, board);
                code = outcome::BAD_FPGA;
            }
            let layer = address & 0x07;
            if layer != board {
                self.log.record(FaultCode::DetectorBoardOrder, layer, board);
            }
            if usize::from(list_len) > MAX_BOARD_BYTES {
                self.log
                    .record(FaultCode::DetectorHitsTooBig, list_len, layer);
            }

            let mut list = Vec::with_capacity(usize::from(list_len).min(MAX_BOARD_BYTES));
            list.push(id_byte);
            list.push(address);
            for _ in 2..usize::from(list_len) {
                let byte = self.get_byte(start, 10);
                if list.len() < MAX_BOARD_BYTES {
                    list.push(byte);
                }
            }
            self.arena.set(usize::from(layer), &list);
        }

        debug!(
            trigger_count = self.event.trigger_count,
            boards, code, "detector event read"
        );
        if code == outcome::OK {
            PacketOutcome::ok(Vec::new())
        } else {
            PacketOutcome::failed(code)
        }
    }

    fn read_housekeeping_payload(&mut self, start: Tick, len: u8) -> PacketOutcome {
        let mut count = self.get_byte(start, 11);
        if len != count.wrapping_add(6) {
            self.log
                .record(FaultCode::DetectorBadDataCount, len, count);
            count = len.wrapping_sub(6);
        }
        self.cmd_count =
            (u16::from(self.get_byte(start, 12)) << 8) | u16::from(self.get_byte(start, 13));
        let fpga = self.get_byte(start, 14);
        if fpga > 8 {
            self.log.record(FaultCode::DetectorBadFpga, self.last_code, fpga);
        }
        let code = self.get_byte(start, 15);
        if code != self.last_code {
            self.log
                .record(FaultCode::DetectorBadEcho, code, self.last_code);
        }

        let mut data = Vec::new();
        for _ in 0..count {
            let byte = self.get_byte(start, 16);
            if data.len() < HOUSEKEEPING_CAPACITY {
                data.push(byte);
            }
        }
        if let Some(&trailer) = data.last() {
            if trailer != 0x0F {
                self.log
                    .record(FaultCode::DetectorBadTrailer, self.last_code, trailer);
            }
        }
        // A new payload displaces any older one, sent out or not.
        self.housekeeping = (!data.is_empty()).then_some(Housekeeping { fpga, code, data });
        PacketOutcome::ok(Vec::new())
    }

    fn read_echo_payload(&mut self, start: Tick, len: u8) -> PacketOutcome {
        if len != 4 {
            self.log
                .record(FaultCode::DetectorBadLength, type_code::ECHO, len);
        }
        let hi = self.get_byte(start, 17);
        let lo = self.get_byte(start, 18);
        let echoed = self.get_byte(start, 19);
        self.cmd_count = (u16::from(hi) << 8) | u16::from(lo);

        let payload = vec![hi, lo, echoed];
        if echoed != self.last_code {
            self.log
                .record(FaultCode::DetectorBadEcho, echoed, self.last_code);
            return PacketOutcome {
                code: outcome::ECHO_MISMATCH,
                payload,
            };
        }
        PacketOutcome::ok(payload)
    }

    /// Unrecognized type code: log it and drain the declared payload so
    /// the link does not desynchronize, keeping a bounded prefix for
    /// diagnostics.
    fn drain_unknown(&mut self, start: Tick, id: u8, len: u8) -> PacketOutcome {
        warn!(id, len, "unknown detector packet type");
        self.log.record(FaultCode::DetectorBadId, id, len);
        let mut kept = Vec::new();
        for _ in 0..len {
            let byte = self.get_byte(start, 20);
            if kept.len() < 15 {
                kept.push(byte);
            }
        }
        PacketOutcome::ok(kept)
    }

    /// Zeroed event header plus placeholder hit lists for every configured
    /// board. Used when the readout produced nothing usable.
    pub fn synthesize_empty_event(&mut self, tag: u8) {
        self.event = DetectorEvent {
            trigger_count: 0,
            cmd_count: 0,
            pattern: 0,
            board_count: self.config.board_count,
        };
        self.install_placeholders(tag);
    }

    fn install_placeholders(&mut self, tag: u8) {
        for board in 0..self.config.board_count {
            self.set_placeholder(board, tag);
        }
    }

    fn set_placeholder(&mut self, board: u8, tag: u8) {
        self.arena.set(
            usize::from(board),
            &[
                placeholder::ID_BYTE,
                board,
                0x00,
                tag,
                placeholder::TRAILER,
            ],
        );
    }

    /// Poll the detector until it reports event data ready, bounded by the
    /// configured attempt count.
    pub fn poll_data_ready(&mut self) -> bool {
        let mut last_status = 0u8;
        let attempts = self.config.status_attempts;
        for attempt in 0..attempts {
            if self.write_command(0, det_cmd::STATUS, &[], 0xFF) {
                self.read_packet(Expected::Housekeeping);
                if let Some(hk) = self.housekeeping.take() {
                    match hk.data.first().copied() {
                        Some(STATUS_READY) => return true,
                        Some(STATUS_NOT_READY) => last_status = STATUS_NOT_READY,
                        Some(other) => {
                            last_status = other;
                            self.log
                                .record(FaultCode::DetectorBadStatus, other, attempt);
                        }
                        None => {}
                    }
                }
            }
        }
        self.log
            .record(FaultCode::DetectorBadStatus, last_status, attempts + 1);
        false
    }

    /// Issue the read-event command and parse the readout. On failure the
    /// receive queue is flushed and every board's logic is reset so the
    /// next cycle starts aligned.
    pub fn request_event(&mut self) -> u8 {
        self.request_event_with(&[0x00], 0x77)
    }

    /// Read-event for a calibration trigger tag.
    pub fn request_calibration_event(&mut self, tag: u8) -> u8 {
        self.request_event_with(&[0x04 | (tag & 0x03)], 0x43)
    }

    fn request_event_with(&mut self, data: &[u8], fail_site: u8) -> u8 {
        let _ = self.write_command(0, det_cmd::READ_EVENT, data, 0xFF);
        let result = self.read_packet(Expected::Event);
        if !result.is_ok() {
            self.log
                .record(FaultCode::DetectorReadFailed, result.code, fail_site);
            self.port.clear_rx();
            self.reset_all_logic();
        }
        result.code
    }

    /// Reset the state machines of every board.
    pub fn reset_all_logic(&mut self) {
        for board in 0..self.config.board_count {
            self.send_simple(board, det_cmd::LOGIC_RESET);
        }
    }

    /// Variable-length register data following a configuration read: a
    /// count byte, then that many bytes.
    pub fn read_register_block(&mut self) -> Vec<u8> {
        let start = self.clock.now();
        let count = self.get_byte(start, 69);
        let mut out = Vec::with_capacity(usize::from(count) + 1);
        out.push(count);
        for i in 0..count {
            let start = self.clock.now();
            out.push(self.get_byte(start, 70u8.wrapping_add(i)));
        }
        out
    }

    /// Fixed 4-byte response to a detector-side I2C register read.
    pub fn read_i2c_block(&mut self) -> Vec<u8> {
        let start = self.clock.now();
        (0..4u8)
            .map(|i| self.get_byte(start, 0x89 + i))
            .collect()
    }

    /// Trigger-primitive data after a calibration strobe: a rubbish lead
    /// byte, then nine bytes whose first carries the board address.
    pub fn read_trigger_primitives(&mut self, fpga: u8) -> Vec<u8> {
        let start = self.clock.now();
        let _ = self.get_byte(start, 0x44);
        let first = self.get_byte(start, 0x45);
        let echoed = (first & 0x38) >> 3;
        if echoed != fpga {
            self.log
                .record(FaultCode::DetectorBadTriggerHeader, fpga, echoed);
        }
        let mut out = vec![first];
        for _ in 1..9 {
            out.push(self.get_byte(start, 0x46));
        }
        out
    }

    /// Input-timing calibration for one board: start self-calibration,
    /// generate data edges by reading a configuration register repeatedly
    /// on every chip, then latch the calibrated delay.
    pub fn calibrate_timing(&mut self, fpga: u8) {
        self.send_simple(fpga, det_cmd::CAL_TIMING_START);
        for chip in 0..12u8 {
            for _ in 0..5 {
                if self.write_command(fpga, det_cmd::CONFIG_READ, &[chip], 0xEE) {
                    let _ = self.read_register_block();
                }
            }
        }
        self.send_simple(fpga, det_cmd::CAL_TIMING_SET);
    }

    /// Calibrate input timing on every configured board.
    pub fn calibrate_all(&mut self) {
        for board in 0..self.config.board_count {
            self.calibrate_timing(board);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use board_hal::{ManualClock, ScriptedPort};

    struct Fixture {
        port: Arc<ScriptedPort>,
        log: Arc<ErrorLog>,
        link: DetectorLink,
    }

    fn fixture(board_count: u8) -> Fixture {
        let port = Arc::new(ScriptedPort::new());
        let clock = Arc::new(ManualClock::new());
        clock.auto_advance(1);
        let log = Arc::new(ErrorLog::new());
        let link = DetectorLink::new(
            Arc::clone(&port) as SharedPort,
            clock as SharedClock,
            Arc::clone(&log),
            DetectorConfig {
                board_count,
                ..DetectorConfig::default()
            },
        );
        Fixture { port, log, link }
    }

    /// A well-formed single-board event packet (after the length/type pair).
    fn event_packet(trigger: u16, boards: &[&[u8]]) -> Vec<u8> {
        let mut bytes = vec![5, type_code::EVENT];
        bytes.push((trigger >> 8) as u8);
        bytes.push(trigger as u8);
        bytes.push(0x02); // detector command count
        bytes.push(0x40 | boards.len() as u8); // bending-view pattern + count
        for (i, hits) in boards.iter().enumerate() {
            bytes.push(hits.len() as u8 + 2);
            bytes.push(placeholder::ID_BYTE);
            bytes.push(i as u8);
            bytes.extend_from_slice(hits);
        }
        bytes
    }

    #[test]
    fn event_parses_header_and_hit_lists() {
        let mut f = fixture(2);
        f.port
            .feed(&event_packet(0x1234, &[&[0xAA, 0xBB], &[0xCC, 0xDD, 0xEE]]));

        let result = f.link.read_packet(Expected::Event);
        assert!(result.is_ok());
        assert_eq!(f.link.event().trigger_count, 0x1234);
        assert_eq!(f.link.event().cmd_count, 0x02);
        assert_eq!(f.link.event().pattern, 0x40);
        assert_eq!(f.link.event().board_count, 2);
        assert_eq!(
            f.link.arena().get(0).unwrap(),
            &[placeholder::ID_BYTE, 0, 0xAA, 0xBB]
        );
        assert_eq!(
            f.link.arena().get(1).unwrap(),
            &[placeholder::ID_BYTE, 1, 0xCC, 0xDD, 0xEE]
        );
        assert!(f.log.is_empty());
    }

    #[test]
    fn board_count_mismatch_substitutes_placeholders() {
        let mut f = fixture(3);
        f.port.feed(&event_packet(7, &[&[0xAA, 0xBB]]));

        let result = f.link.read_packet(Expected::Event);
        assert_eq!(result.code, outcome::BOARD_COUNT);
        assert_eq!(f.link.event().board_count, 3);
        for board in 0..3u8 {
            let list = f.link.arena().get(usize::from(board)).unwrap();
            assert_eq!(
                list,
                &[
                    placeholder::ID_BYTE,
                    board,
                    0,
                    placeholder::TAG_BOARD_COUNT,
                    placeholder::TRAILER
                ]
            );
        }
        assert_eq!(
            f.log.drain()[0].code,
            FaultCode::DetectorBoardCount
        );
    }

    #[test]
    fn wrong_type_for_event_gives_placeholder_cycle() {
        let mut f = fixture(1);
        f.port.feed(&[4, type_code::ECHO, 0, 1, 0x57]);

        let result = f.link.read_packet(Expected::Event);
        assert_eq!(result.code, outcome::WRONG_TYPE);
        let list = f.link.arena().get(0).unwrap();
        assert_eq!(list[3], placeholder::TAG_WRONG_TYPE);
        assert_eq!(f.link.event().trigger_count, 0);
    }

    #[test]
    fn bad_board_identifier_placeholders_that_board_only() {
        let mut f = fixture(2);
        let mut bytes = vec![5, type_code::EVENT, 0, 1, 0, 2];
        // First board carries a wrong identifier byte; only its two
        // leading bytes are consumed before moving on.
        bytes.extend_from_slice(&[4, 0x00]);
        // Second board is healthy.
        bytes.extend_from_slice(&[4, placeholder::ID_BYTE, 1, 0x99, 0x98]);
        f.port.feed(&bytes);

        let result = f.link.read_packet(Expected::Event);
        assert_eq!(result.code, outcome::BAD_BOARD_ID);
        assert_eq!(
            f.link.arena().get(0).unwrap()[3],
            placeholder::TAG_BAD_BOARD_ID
        );
        assert_eq!(
            f.link.arena().get(1).unwrap(),
            &[placeholder::ID_BYTE, 1, 0x99, 0x98]
        );
    }

    #[test]
    fn byte_timeout_substitutes_zero_and_logs_site() {
        let mut f = fixture(1);
        // Nothing scripted at all: every read times out.
        let result = f.link.read_packet(Expected::Event);
        assert_eq!(result.code, outcome::WRONG_TYPE);
        let faults = f.log.drain();
        assert!(faults
            .iter()
            .any(|r| r.code == FaultCode::DetectorReadTimeout && r.value1 == 1));
        assert!(faults
            .iter()
            .any(|r| r.code == FaultCode::DetectorReadTimeout && r.value1 == 2));
    }

    #[test]
    fn echo_mismatch_is_flagged() {
        let mut f = fixture(1);
        f.port.feed(&[4, type_code::ECHO, 0x00, 0x05, 0x65]);
        f.link.write_command(0, 0x44, &[], 0xFF);
        f.port.clear_written();

        let result = f.link.read_packet(Expected::Echo);
        assert_eq!(result.code, outcome::ECHO_MISMATCH);
        assert_eq!(result.payload, vec![0x00, 0x05, 0x65]);
        assert_eq!(f.link.cmd_count(), 5);
        assert_eq!(f.log.drain()[0].code, FaultCode::DetectorBadEcho);
    }

    #[test]
    fn housekeeping_count_corrected_against_frame_length() {
        let mut f = fixture(1);
        f.link.write_command(0, det_cmd::STATUS, &[], 0xFF);
        // Frame length 8 implies 2 data bytes, but the packet declares 5.
        f.port
            .feed(&[8, type_code::HOUSEKEEPING, 5, 0x00, 0x03, 0, det_cmd::STATUS, 0x59, 0x0F]);

        let result = f.link.read_packet(Expected::Housekeeping);
        assert!(result.is_ok());
        let hk = f.link.take_housekeeping().unwrap();
        assert_eq!(hk.data, vec![0x59, 0x0F]);
        assert_eq!(f.link.cmd_count(), 3);
        assert_eq!(
            f.log.drain()[0].code,
            FaultCode::DetectorBadDataCount
        );
    }

    #[test]
    fn unknown_type_drains_declared_length() {
        let mut f = fixture(1);
        let mut bytes = vec![20, 0x99];
        bytes.extend((0..20).map(|i| i as u8));
        bytes.extend_from_slice(&[4, type_code::ECHO, 0, 1, 0]);
        f.port.feed(&bytes);

        let result = f.link.read_packet(Expected::Any);
        assert!(result.is_ok());
        assert_eq!(result.payload.len(), 15);
        assert_eq!(f.log.drain()[0].code, FaultCode::DetectorBadId);
        // The follow-on packet is still aligned.
        let echo = f.link.read_packet(Expected::Echo);
        assert_eq!(echo.payload, vec![0, 1, 0]);
    }

    #[test]
    fn oversize_hit_list_truncates_but_consumes_wire_bytes() {
        let mut f = fixture(1);
        let mut bytes = vec![5, type_code::EVENT, 0, 1, 0, 1];
        bytes.push(255);
        bytes.push(placeholder::ID_BYTE);
        bytes.push(0);
        bytes.extend(std::iter::repeat(0x77).take(253));
        f.port.feed(&bytes);

        let result = f.link.read_packet(Expected::Event);
        // Truncation is a fault, not a failed readout.
        assert!(result.is_ok());
        assert_eq!(f.link.arena().get(0).unwrap().len(), MAX_BOARD_BYTES);
        assert_eq!(f.port.rx_remaining(), 0);
        assert!(f
            .log
            .drain()
            .iter()
            .any(|r| r.code == FaultCode::DetectorHitsTooBig));
    }

    #[test]
    fn send_simple_skips_echo_for_echoless_codes() {
        let mut f = fixture(1);
        f.link.send_simple(2, 0x67);
        assert_eq!(f.port.written(), vec![2, 0x67, 0]);
        // No echo was read and no fault recorded.
        assert!(f.log.is_empty());
    }

    #[test]
    fn transmit_stall_logs_and_aborts() {
        let mut f = fixture(1);
        f.port.stall_tx(true);
        assert!(!f.link.write_command(0, 0x65, &[], 0xFF));
        let faults = f.log.drain();
        assert_eq!(faults[0].code, FaultCode::TxFailed);
        assert_eq!(faults[0].value0, 0x65);
    }

    #[test]
    fn poll_data_ready_retries_then_succeeds() {
        let mut f = fixture(1);
        // Two not-ready responses, then ready.
        for status in [STATUS_NOT_READY, STATUS_NOT_READY, STATUS_READY] {
            f.port
                .feed(&[8, type_code::HOUSEKEEPING, 2, 0, 0, 0, det_cmd::STATUS, status, 0x0F]);
        }
        assert!(f.link.poll_data_ready());
        assert!(f.link.take_housekeeping().is_none());
    }

    #[test]
    fn poll_data_ready_gives_up_after_attempts() {
        let mut f = fixture(1);
        for _ in 0..10 {
            f.port
                .feed(&[8, type_code::HOUSEKEEPING, 2, 0, 0, 0, det_cmd::STATUS, STATUS_NOT_READY, 0x0F]);
        }
        assert!(!f.link.poll_data_ready());
        let faults = f.log.drain();
        assert_eq!(faults.last().unwrap().code, FaultCode::DetectorBadStatus);
        assert_eq!(faults.last().unwrap().value1, 11);
    }

    #[test]
    fn synthesized_empty_event_uses_not_ready_tag() {
        let mut f = fixture(2);
        f.link.synthesize_empty_event(placeholder::TAG_NOT_READY);
        assert_eq!(f.link.event().board_count, 2);
        assert_eq!(
            f.link.arena().get(1).unwrap()[3],
            placeholder::TAG_NOT_READY
        );
    }
}
