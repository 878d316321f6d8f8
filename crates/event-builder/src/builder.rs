//! Per-trigger assembly sequence

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use board_hal::{AnalogReader, Clock, RealTimeClock, SharedClock, SharedRtc, Tick};
use detector_link::{placeholder, DetectorLink};
use error_log::{ErrorLog, FaultCode};
use tof_correlator::{Correlator, TofChannel};

use crate::arbiter::TriggerSnapshot;
use crate::record::{pack_datetime, serialize_event, EventHeader, ANALOG_CHANNELS};

/// Builder timeouts, in 5 ms ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Wait for the analog conversion-complete flag.
    pub analog_timeout: Tick,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self { analog_timeout: 20 }
    }
}

/// Runs one assembly cycle per latched trigger.
///
/// Every step below has a degraded fallback; the builder always reaches
/// serialization and hands back a well-formed record.
pub struct EventBuilder {
    clock: SharedClock,
    rtc: SharedRtc,
    analog: Arc<dyn AnalogReader>,
    log: Arc<ErrorLog>,
    config: BuilderConfig,
}

impl EventBuilder {
    pub fn new(
        clock: SharedClock,
        rtc: SharedRtc,
        analog: Arc<dyn AnalogReader>,
        log: Arc<ErrorLog>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            clock,
            rtc,
            analog,
            log,
            config,
        }
    }

    /// Assemble the record for one latched trigger.
    ///
    /// Waits (bounded) for the analog conversions, reads or synthesizes
    /// the detector payload, correlates the timing channels against the
    /// trigger timestamp, and serializes. The cycle's hit lists are
    /// consumed; the caller re-arms the trigger after the record ships.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        snapshot: TriggerSnapshot,
        run_number: u16,
        read_detector: bool,
        accepted: u32,
        raw: u32,
        link: &mut DetectorLink,
        tof_a: &TofChannel,
        tof_b: &TofChannel,
        correlator: &Correlator,
    ) -> Vec<u8> {
        let analog = self.read_analog(accepted);

        if read_detector && link.poll_data_ready() {
            link.request_event();
        } else {
            link.synthesize_empty_event(placeholder::TAG_NOT_READY);
        }

        let correlation = correlator.correlate(tof_a, tof_b, snapshot.timestamp as u16);
        debug!(
            timestamp = snapshot.timestamp,
            dt = correlation.dt,
            found = correlation.found_pair(),
            "cycle correlated"
        );

        let header = EventHeader {
            run_number,
            accepted,
            timestamp: snapshot.timestamp,
            raw,
            datetime: pack_datetime(&self.rtc.read()),
            status: snapshot.status,
        };
        let record = serialize_event(
            &header,
            &analog,
            correlation.dt_wire(),
            link.event(),
            link.arena(),
            &self.log,
        );
        link.clear_cycle();
        record
    }

    /// Bounded wait for conversion-complete, then read all channels.
    /// Timeout logs a fault and reads whatever the converters hold.
    fn read_analog(&self, accepted: u32) -> [u16; ANALOG_CHANNELS] {
        let start = self.clock.now();
        while !self.analog.ready() {
            if self.clock.now().wrapping_sub(start) > self.config.analog_timeout {
                self.log
                    .record(FaultCode::AnalogTimeout, accepted as u8, (accepted >> 8) as u8);
                break;
            }
        }
        let mut values = [0u16; ANALOG_CHANNELS];
        for (channel, value) in values.iter_mut().enumerate() {
            *value = self.analog.read(channel);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use board_hal::{FixedRtc, ManualClock, MockAnalog, ScriptedPort, SharedPort};
    use detector_link::{type_code, DetectorConfig};
    use tof_correlator::TofSample;

    struct Fixture {
        builder: EventBuilder,
        link: DetectorLink,
        port: Arc<ScriptedPort>,
        analog: Arc<MockAnalog>,
        log: Arc<ErrorLog>,
        tof_a: TofChannel,
        tof_b: TofChannel,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        clock.auto_advance(1);
        let log = Arc::new(ErrorLog::new());
        let analog = Arc::new(MockAnalog::new());
        let port = Arc::new(ScriptedPort::new());
        let link = DetectorLink::new(
            Arc::clone(&port) as SharedPort,
            Arc::clone(&clock) as SharedClock,
            Arc::clone(&log),
            DetectorConfig::default(),
        );
        let builder = EventBuilder::new(
            Arc::clone(&clock) as SharedClock,
            Arc::new(FixedRtc::epoch()),
            Arc::clone(&analog) as Arc<dyn AnalogReader>,
            Arc::clone(&log),
            BuilderConfig::default(),
        );
        Fixture {
            builder,
            link,
            port,
            analog,
            log,
            tof_a: TofChannel::new(),
            tof_b: TofChannel::new(),
        }
    }

    fn build(f: &mut Fixture, timestamp: u32, read_detector: bool) -> Vec<u8> {
        f.builder.build(
            TriggerSnapshot {
                timestamp,
                status: 0x0D,
            },
            320,
            read_detector,
            1,
            1,
            &mut f.link,
            &f.tof_a,
            &f.tof_b,
            &Correlator::default(),
        )
    }

    #[test]
    fn detector_disabled_cycle_yields_placeholder_boards() {
        let mut f = fixture();
        f.analog.set_values([10, 20, 30, 40, 50, 60]);

        let record = build(&mut f, 1000, false);
        assert_eq!(&record[0..4], b"ZERO");
        assert_eq!(&record[10..14], &1000u32.to_be_bytes());
        assert_eq!(record[41], 1);
        // Not-ready placeholder in the single board slot.
        assert_eq!(record[45], 0x00);
        assert_eq!(record[46], placeholder::TAG_NOT_READY);
        assert_eq!(&record[record.len() - 4..], b"FINI");
        // Nothing was sent to the detector.
        assert!(f.port.written().is_empty());
        assert!(f.log.is_empty());
    }

    #[test]
    fn analog_timeout_logs_and_proceeds() {
        let mut f = fixture();
        f.analog.delay_ready(10_000);

        let record = build(&mut f, 500, false);
        assert_eq!(&record[0..4], b"ZERO");
        let faults = f.log.drain();
        assert_eq!(faults[0].code, FaultCode::AnalogTimeout);
        assert_eq!(faults[0].value0, 1);
    }

    #[test]
    fn tof_pair_lands_in_the_record_and_rings_clear() {
        let mut f = fixture();
        let tag = 1000u32 as u16;
        f.tof_a.capture(TofSample::new(100, 5000, tag).raw, tag);
        f.tof_b.capture(TofSample::new(100, 5040, tag).raw, tag);

        let record = build(&mut f, 1000, false);
        assert_eq!(&record[35..37], &40i16.to_be_bytes());
        assert_eq!(f.tof_a.fill_count(), 0);
        assert_eq!(f.tof_b.fill_count(), 0);
    }

    #[test]
    fn no_tof_pair_writes_the_sentinel() {
        let mut f = fixture();
        let record = build(&mut f, 1000, false);
        assert_eq!(&record[35..37], &32767i16.to_be_bytes());
    }

    #[test]
    fn ready_detector_readout_reaches_the_record() {
        let mut f = fixture();
        // Status poll answers ready, then the event readout follows.
        f.port.feed(&[
            8,
            type_code::HOUSEKEEPING,
            2,
            0,
            0,
            0,
            0x57,
            0x59,
            0x0F,
        ]);
        f.port
            .feed(&[5, type_code::EVENT, 0x12, 0x34, 0x05, 0x01]);
        f.port.feed(&[4, placeholder::ID_BYTE, 0, 0xAB, 0xCD]);

        let record = build(&mut f, 2000, true);
        assert_eq!(&record[37..39], &0x1234u16.to_be_bytes());
        assert_eq!(record[39], 0x05);
        assert_eq!(record[41], 1);
        assert_eq!(&record[44..48], &[placeholder::ID_BYTE, 0, 0xAB, 0xCD]);
        assert!(f.log.is_empty());
        // The cycle's hit lists were consumed.
        assert_eq!(f.link.arena().filled(), 0);
    }
}
