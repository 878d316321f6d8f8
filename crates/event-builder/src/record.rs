//! Wire-format event record

use chrono::{DateTime, Datelike, Timelike, Utc};

use detector_link::{placeholder, DetectorEvent, HitArena};
use error_log::{ErrorLog, FaultCode};

/// Leading record marker.
pub const EVENT_MARKER: [u8; 4] = *b"ZERO";

/// Trailing record marker.
pub const EVENT_TRAILER: [u8; 4] = *b"FINI";

/// Hard ceiling on one serialized record.
pub const MAX_EVENT_BYTES: usize = 256;

/// Analog channels carried in every record.
pub const ANALOG_CHANNELS: usize = 6;

/// Fixed header fields of one event record.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventHeader {
    pub run_number: u16,
    /// Accepted-trigger count, the event number.
    pub accepted: u32,
    /// Tick count latched at the trigger edge.
    pub timestamp: u32,
    /// Every trigger edge this run, including dead time.
    pub raw: u32,
    /// Packed date and time, see [`pack_datetime`].
    pub datetime: u32,
    /// Trigger status flags.
    pub status: u8,
}

/// Pack a date/time into the record's 4-byte field:
/// years since 2000 in the top six bits, then month, day, hour, minute,
/// second.
pub fn pack_datetime(value: &DateTime<Utc>) -> u32 {
    let year = value.year().saturating_sub(2000).clamp(0, 63) as u32;
    (year << 26)
        | (value.month() << 22)
        | (value.day() << 17)
        | (value.hour() << 12)
        | (value.minute() << 6)
        | value.second()
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Serialize one complete event record.
///
/// Boards that would push the record past [`MAX_EVENT_BYTES`] are dropped
/// with an oversize fault; a board slot left empty by the readout
/// serializes as a placeholder list so the record stays parseable.
pub fn serialize_event(
    header: &EventHeader,
    analog: &[u16; ANALOG_CHANNELS],
    dt_wire: i16,
    event: &DetectorEvent,
    arena: &HitArena,
    log: &ErrorLog,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_EVENT_BYTES);
    out.extend_from_slice(&EVENT_MARKER);
    push_u16(&mut out, header.run_number);
    push_u32(&mut out, header.accepted);
    push_u32(&mut out, header.timestamp);
    push_u32(&mut out, header.raw);
    push_u32(&mut out, header.datetime);
    out.push(header.status);
    for &value in analog {
        push_u16(&mut out, value);
    }
    out.extend_from_slice(&dt_wire.to_be_bytes());
    push_u16(&mut out, event.trigger_count);
    out.push(event.cmd_count);
    out.push(event.pattern);
    out.push(event.board_count);
    serialize_boards(&mut out, event.board_count, arena, header, log);
    out.extend_from_slice(&EVENT_TRAILER);
    out
}

/// Detector-only record used by the calibration read command: markers and
/// hit lists with no trigger header.
pub fn serialize_detector_only(event: &DetectorEvent, arena: &HitArena, log: &ErrorLog) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_EVENT_BYTES);
    out.extend_from_slice(&EVENT_MARKER);
    out.push(event.board_count);
    serialize_boards(&mut out, event.board_count, arena, &EventHeader::default(), log);
    out.extend_from_slice(&EVENT_TRAILER);
    out
}

fn serialize_boards(
    out: &mut Vec<u8>,
    board_count: u8,
    arena: &HitArena,
    header: &EventHeader,
    log: &ErrorLog,
) {
    for board in 0..board_count {
        let hits = arena.get(usize::from(board));
        let hit_len = hits.map_or(detector_link::PLACEHOLDER_LEN, <[u8]>::len);
        if out.len() > MAX_EVENT_BYTES - (5 + hit_len) {
            log.record(
                FaultCode::EventTooBig,
                (header.accepted >> 24) as u8,
                (header.timestamp >> 24) as u8,
            );
            break;
        }
        out.push(board);
        match hits {
            Some(hits) => {
                out.push(hits.len() as u8);
                out.extend_from_slice(hits);
            }
            None => {
                // The readout never filled this slot; emit the distinct
                // empty-slot placeholder.
                out.push(detector_link::PLACEHOLDER_LEN as u8);
                out.extend_from_slice(&[
                    placeholder::ID_BYTE,
                    board,
                    0x00,
                    placeholder::TAG_EMPTY_SLOT,
                    placeholder::TRAILER,
                ]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn arena_with(boards: &[&[u8]]) -> HitArena {
        let mut arena = HitArena::new();
        for (i, bytes) in boards.iter().enumerate() {
            arena.set(i, bytes);
        }
        arena
    }

    #[test]
    fn datetime_packs_fields_into_word() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 15, 11, 42, 7).unwrap();
        let word = pack_datetime(&dt);
        assert_eq!(word >> 26, 24);
        assert_eq!((word >> 22) & 0x0F, 3);
        assert_eq!((word >> 17) & 0x1F, 15);
        assert_eq!((word >> 12) & 0x1F, 11);
        assert_eq!((word >> 6) & 0x3F, 42);
        assert_eq!(word & 0x3F, 7);
    }

    #[test]
    fn record_layout_matches_the_wire_format() {
        let header = EventHeader {
            run_number: 320,
            accepted: 7,
            timestamp: 1000,
            raw: 12,
            datetime: 0xA1B2_C3D4,
            status: 0x0D,
        };
        let event = DetectorEvent {
            trigger_count: 0x0102,
            cmd_count: 3,
            pattern: 0x80,
            board_count: 1,
        };
        let arena = arena_with(&[&[0xE7, 0, 0x11, 0x22]]);
        let log = ErrorLog::new();
        let analog = [100, 200, 300, 400, 500, 600];

        let out = serialize_event(&header, &analog, -40, &event, &arena, &log);

        assert_eq!(&out[0..4], b"ZERO");
        assert_eq!(&out[4..6], &320u16.to_be_bytes());
        assert_eq!(&out[6..10], &7u32.to_be_bytes());
        assert_eq!(&out[10..14], &1000u32.to_be_bytes());
        assert_eq!(&out[14..18], &12u32.to_be_bytes());
        assert_eq!(&out[18..22], &0xA1B2_C3D4u32.to_be_bytes());
        assert_eq!(out[22], 0x0D);
        assert_eq!(&out[23..25], &100u16.to_be_bytes());
        assert_eq!(&out[33..35], &600u16.to_be_bytes());
        assert_eq!(&out[35..37], &(-40i16).to_be_bytes());
        assert_eq!(&out[37..39], &0x0102u16.to_be_bytes());
        assert_eq!(out[39], 3);
        assert_eq!(out[40], 0x80);
        assert_eq!(out[41], 1);
        assert_eq!(out[42], 0); // board index
        assert_eq!(out[43], 4); // hit list length
        assert_eq!(&out[44..48], &[0xE7, 0, 0x11, 0x22]);
        assert_eq!(&out[48..52], b"FINI");
        assert!(log.is_empty());
    }

    #[test]
    fn empty_slot_serializes_the_empty_slot_placeholder() {
        let event = DetectorEvent {
            board_count: 2,
            ..DetectorEvent::default()
        };
        let arena = arena_with(&[&[0xE7, 0, 0x11, 0x22]]);
        let log = ErrorLog::new();

        let out = serialize_event(
            &EventHeader::default(),
            &[0; 6],
            0,
            &event,
            &arena,
            &log,
        );
        let second_board = 42 + 6;
        assert_eq!(out[second_board], 1);
        assert_eq!(out[second_board + 1], 5);
        assert_eq!(
            &out[second_board + 2..second_board + 7],
            &[0xE7, 1, 0x00, placeholder::TAG_EMPTY_SLOT, 0x30]
        );
    }

    #[test]
    fn oversize_event_truncates_boards_and_logs() {
        let big = vec![0x55u8; 120];
        let arena = arena_with(&[&big, &big, &big]);
        let event = DetectorEvent {
            board_count: 3,
            ..DetectorEvent::default()
        };
        let log = ErrorLog::new();

        let out = serialize_event(
            &EventHeader {
                accepted: 0x0900_0000,
                timestamp: 0x0400_0000,
                ..EventHeader::default()
            },
            &[0; 6],
            0,
            &event,
            &arena,
            &log,
        );

        assert!(out.len() <= MAX_EVENT_BYTES);
        assert_eq!(&out[out.len() - 4..], b"FINI");
        // Only the first board fit; the rest were dropped at the boundary.
        let faults = log.drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, FaultCode::EventTooBig);
        assert_eq!(faults[0].value0, 0x09);
        assert_eq!(faults[0].value1, 0x04);
    }

    #[test]
    fn detector_only_record_has_no_trigger_header() {
        let arena = arena_with(&[&[0xE7, 0, 1, 2]]);
        let event = DetectorEvent {
            board_count: 1,
            ..DetectorEvent::default()
        };
        let log = ErrorLog::new();
        let out = serialize_detector_only(&event, &arena, &log);
        assert_eq!(&out[0..4], b"ZERO");
        assert_eq!(out[4], 1);
        assert_eq!(out[5], 0);
        assert_eq!(out[6], 4);
        assert_eq!(&out[11..15], b"FINI");
    }
}
