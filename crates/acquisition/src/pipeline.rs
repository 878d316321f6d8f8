//! Cooperative main loop
//!
//! One `poll` per iteration: latched trigger into the event builder,
//! envelope output, command timeout, command intake and dispatch,
//! housekeeping forwarding, debug streaming. Interrupt-side producers
//! (trigger edge, timing captures, singles rates) reach the loop through
//! the shared handles in [`InterruptHandles`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use board_hal::{reg, Clock, ControlRegisters, SerialPort, TofChip, TOF_CONFIG_LEN};
use command_channel::{majority_vote, Command, CommandAssembler, CommandQueue, BOARD_ADDRESS};
use detector_link::DetectorLink;
use error_log::{ErrorLog, FaultCode};
use event_builder::{EventBuilder, SinglesCounters, TriggerArbiter};
use output_framer::{OutputFramer, ResponseKind, Transport};
use tof_correlator::{Correlator, TofChannel};

use crate::config::AcquisitionConfig;
use crate::dispatch;
use crate::io::BoardIo;

/// Boot-time configuration of the timing chip.
const DEFAULT_TOF_CONFIG: [u8; TOF_CONFIG_LEN] = [
    0xB5, 0x05, 0x0C, 0x8D, 0x20, 0x00, 0x00, 0x08, 0xA1, 0x13, 0x00, 0x0A, 0xCC, 0xCC, 0xF1,
    0x7D, 0x00,
];

/// Which transport carries output, switchable by command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Synchronous inter-board link.
    Sync,
    /// Host serial link.
    #[default]
    Host,
}

/// One envelope waiting to go out.
struct Outgoing {
    kind: ResponseKind,
    echo: Vec<u8>,
    payload: Vec<u8>,
    /// Re-open the trigger gate once this envelope has shipped.
    rearm_trigger: bool,
}

/// Shared handles for the interrupt-side producers.
#[derive(Clone)]
pub struct InterruptHandles {
    pub arbiter: Arc<TriggerArbiter>,
    pub tof_a: Arc<TofChannel>,
    pub tof_b: Arc<TofChannel>,
    pub singles: Arc<SinglesCounters>,
}

/// The acquisition pipeline: every subsystem plus the run state.
pub struct Pipeline {
    pub(crate) io: BoardIo,
    pub(crate) log: Arc<ErrorLog>,
    queue: CommandQueue,
    assembler: CommandAssembler,
    pub(crate) link: DetectorLink,
    pub(crate) tof_a: Arc<TofChannel>,
    pub(crate) tof_b: Arc<TofChannel>,
    pub(crate) correlator: Correlator,
    pub(crate) arbiter: Arc<TriggerArbiter>,
    pub(crate) singles: Arc<SinglesCounters>,
    builder: EventBuilder,
    framer: OutputFramer,
    pub(crate) output_mode: OutputMode,
    pub(crate) run_number: u16,
    pub(crate) read_detector: bool,
    pub(crate) tof_stream: bool,
    pub(crate) tof_config: [u8; TOF_CONFIG_LEN],
    pub(crate) thresholds: [u8; 4],
    outgoing: Option<Outgoing>,
}

impl Pipeline {
    pub fn new(io: BoardIo, config: AcquisitionConfig) -> Self {
        let log = Arc::new(ErrorLog::new());
        let queue = CommandQueue::new(Arc::clone(&log));
        let assembler = CommandAssembler::new(BOARD_ADDRESS, Arc::clone(&log));
        let link = DetectorLink::new(
            Arc::clone(&io.detector_port),
            Arc::clone(&io.clock),
            Arc::clone(&log),
            config.detector,
        );
        let arbiter = Arc::new(TriggerArbiter::new(
            Arc::clone(&io.registers),
            Arc::clone(&io.clock),
        ));
        let singles = Arc::new(SinglesCounters::new(Arc::clone(&io.registers)));
        let builder = EventBuilder::new(
            Arc::clone(&io.clock),
            Arc::clone(&io.rtc),
            Arc::clone(&io.analog),
            Arc::clone(&log),
            config.builder,
        );
        let framer = OutputFramer::new(Arc::clone(&io.clock), Arc::clone(&log));

        let pipeline = Self {
            log,
            queue,
            assembler,
            link,
            tof_a: Arc::new(TofChannel::new()),
            tof_b: Arc::new(TofChannel::new()),
            correlator: Correlator::new(config.correlator),
            arbiter,
            singles,
            builder,
            framer,
            output_mode: config.output_mode,
            run_number: 0,
            read_detector: false,
            tof_stream: false,
            tof_config: DEFAULT_TOF_CONFIG,
            thresholds: [0; 4],
            outgoing: None,
            io,
        };
        pipeline.init_hardware();
        pipeline
    }

    /// Boot-time hardware defaults, mirroring the bring-up sequence:
    /// timing chip configured and enabled, trigger masks and prescales set,
    /// trigger gate closed.
    fn init_hardware(&self) {
        self.io.tof_chip.reset();
        self.io.tof_chip.write_config(&self.tof_config);
        self.io.tof_chip.enable();

        let regs = &self.io.registers;
        regs.write(reg::PRESCALE_1, 255);
        regs.write(reg::PRESCALE_2, 255);
        regs.write(reg::TRIGGER_MASK_1, 0x01);
        regs.write(reg::TRIGGER_MASK_2, 0x05);
        regs.write(reg::PEAK_RESET_WAIT, 72);
        for i in 0..reg::WINDOW_COUNT {
            regs.write(reg::WINDOW_BASE + i, 12);
        }
        self.arbiter.set_enabled(false);
        info!("board initialized");
    }

    /// Handles for the interrupt-side producers.
    pub fn interrupts(&self) -> InterruptHandles {
        InterruptHandles {
            arbiter: Arc::clone(&self.arbiter),
            tof_a: Arc::clone(&self.tof_a),
            tof_b: Arc::clone(&self.tof_b),
            singles: Arc::clone(&self.singles),
        }
    }

    /// The shared fault log.
    pub fn error_log(&self) -> Arc<ErrorLog> {
        Arc::clone(&self.log)
    }

    /// One main-loop iteration. Never blocks.
    pub fn poll(&mut self) {
        self.pump_command_bytes();
        self.build_event_if_ready();
        self.flush_outgoing();
        let now = self.io.clock.now();
        self.assembler.check_timeout(now);
        self.intake_command();
        self.forward_housekeeping();
        self.drain_tof_stream();
    }

    /// Run until `shutdown` is raised (simulator and flight loop).
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!("acquisition loop running");
        while !shutdown.load(Ordering::SeqCst) {
            self.poll();
            std::thread::sleep(Duration::from_micros(200));
        }
        info!("acquisition loop stopped");
    }

    /// Receive-line bytes into the block queue.
    fn pump_command_bytes(&mut self) {
        while let Some(byte) = self.io.command_port.try_read() {
            self.queue.push_byte(byte);
        }
    }

    /// Build and stage an event when a trigger is latched and no command
    /// activity is in flight.
    fn build_event_if_ready(&mut self) {
        if self.outgoing.is_some() || !self.assembler.is_idle() {
            return;
        }
        let Some(snapshot) = self.arbiter.take_latched() else {
            return;
        };
        let accepted = self.arbiter.accepted_count();
        let raw = self.arbiter.raw_count();
        debug!(accepted, timestamp = snapshot.timestamp, "building event");
        let record = self.builder.build(
            snapshot,
            self.run_number,
            self.read_detector,
            accepted,
            raw,
            &mut self.link,
            &self.tof_a,
            &self.tof_b,
            &self.correlator,
        );
        self.singles.save_snapshot();
        self.outgoing = Some(Outgoing {
            kind: ResponseKind::Event,
            echo: Vec::new(),
            payload: record,
            rearm_trigger: true,
        });
    }

    fn active_transport(&self) -> &dyn Transport {
        match self.output_mode {
            OutputMode::Host => self.io.host.as_ref(),
            OutputMode::Sync => self.io.sync.as_ref(),
        }
    }

    /// Stream the staged envelope. The trigger is re-armed afterwards for
    /// event envelopes even if the transport stalled, so a dead transport
    /// cannot freeze acquisition.
    fn flush_outgoing(&mut self) {
        let Some(out) = self.outgoing.take() else {
            return;
        };
        let sent =
            self.framer
                .send(self.active_transport(), out.kind, &out.echo, &out.payload);
        if !sent {
            warn!("envelope dropped, transport stalled");
        }
        if out.rearm_trigger {
            self.arbiter.set_enabled(true);
        }
    }

    /// Pop one block, vote, feed the assembler, dispatch on completion.
    fn intake_command(&mut self) {
        if self.outgoing.is_some() {
            return;
        }
        let Some(block) = self.queue.pop_block() else {
            return;
        };
        let Some(frame) = majority_vote(&block, &self.log) else {
            return;
        };
        let now = self.io.clock.now();
        let Some(raw) = self.assembler.feed(&frame, now) else {
            return;
        };

        let command = Command::parse(&raw);
        if self.arbiter.is_enabled() && !command.allowed_while_enabled() {
            self.log.record(FaultCode::CommandIgnored, raw.opcode, 0);
            return;
        }
        debug!(opcode = raw.opcode, "dispatching command");
        if let Some(payload) = dispatch::dispatch(self, &command) {
            self.outgoing = Some(Outgoing {
                kind: ResponseKind::Command(raw.opcode),
                echo: raw.data,
                payload,
                rearm_trigger: false,
            });
        }
    }

    /// Unsolicited forward of pending detector housekeeping, only while
    /// the trigger is disabled.
    fn forward_housekeeping(&mut self) {
        if self.outgoing.is_some() || self.arbiter.is_enabled() {
            return;
        }
        let Some(hk) = self.link.take_housekeeping() else {
            return;
        };
        let count = hk.data.len() as u8;
        let mut payload = vec![count.wrapping_add(7), detector_link::type_code::HOUSEKEEPING, count];
        payload.extend_from_slice(&self.link.cmd_count().to_be_bytes());
        payload.push(hk.fpga);
        payload.push(hk.code);
        payload.extend_from_slice(&hk.data);
        self.outgoing = Some(Outgoing {
            kind: ResponseKind::Event,
            echo: Vec::new(),
            payload,
            rearm_trigger: false,
        });
    }

    /// Raw capture records straight to the active transport while debug
    /// streaming is on.
    fn drain_tof_stream(&mut self) {
        if !self.tof_stream {
            return;
        }
        for (marker, channel) in [(0xAAu8, &self.tof_a), (0xBB, &self.tof_b)] {
            for sample in channel.take_streamed() {
                let stop = sample.stop();
                let reference = sample.reference();
                let bytes = [
                    marker,
                    (stop >> 8) as u8,
                    stop as u8,
                    (reference >> 8) as u8,
                    reference as u8,
                    (sample.tag >> 8) as u8,
                    sample.tag as u8,
                ];
                let _ = self.active_transport().write(&bytes);
            }
        }
    }

    /// Clock readback is done by the caller; this resets counters, pulses
    /// the hardware reset strobes, and drops the cycle state.
    pub(crate) fn logic_reset(&mut self) {
        self.io.clock.reset();
        self.arbiter.reset_counts();
        self.singles.reset();
        self.io.registers.write(reg::PULSE, reg::PULSE_LOGIC_RST);
        self.io.registers.write(reg::PULSE, reg::PULSE_CNTR_RST);
        self.link.clear_cycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquisitionConfig;
    use crate::io::{BoardIo, MockBoard};
    use board_hal::SerialPort;
    use command_channel::{address_byte, encode_block};
    use tof_correlator::TofSample;

    fn board() -> (Pipeline, MockBoard) {
        let (io, mocks) = BoardIo::mock();
        let pipeline = Pipeline::new(io, AcquisitionConfig::default());
        (pipeline, mocks)
    }

    fn send_command(mocks: &MockBoard, opcode: u8, data: &[u8]) {
        for byte in encode_block(opcode, address_byte(BOARD_ADDRESS, data.len() as u8)) {
            mocks.ground.write(byte).unwrap();
        }
        for (index, &value) in data.iter().enumerate() {
            for byte in encode_block(value, address_byte(BOARD_ADDRESS, index as u8 + 1)) {
                mocks.ground.write(byte).unwrap();
            }
        }
    }

    fn poll(pipeline: &mut Pipeline, times: usize) {
        for _ in 0..times {
            pipeline.poll();
        }
    }

    /// Split one envelope into (type byte, echo, payload).
    fn parse_envelope(bytes: &[u8]) -> (u8, Vec<u8>, Vec<u8>) {
        assert_eq!(bytes[0], 0xDC);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(bytes[2], 0xFF);
        let total = usize::from(bytes[3]);
        let kind = bytes[4];
        let echo_len = usize::from(bytes[5]);
        let echo = bytes[6..6 + echo_len].to_vec();
        let payload = bytes[6 + echo_len..6 + total].to_vec();
        let padding = (3 - total % 3) % 3;
        assert_eq!(&bytes[6 + total + padding..6 + total + padding + 3], &[0xFF, 0x00, 0xFF]);
        (kind, echo, payload)
    }

    #[test]
    fn version_command_round_trips() {
        let (mut pipeline, mocks) = board();
        send_command(&mocks, 0x07, &[]);
        poll(&mut pipeline, 3);

        let (kind, echo, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(kind, 0x07);
        assert!(echo.is_empty());
        assert_eq!(payload, vec![crate::FIRMWARE_VERSION]);
    }

    #[test]
    fn response_echoes_command_data() {
        let (mut pipeline, mocks) = board();
        // Read saved singles for channel 2: one data byte echoed back.
        send_command(&mocks, 0x33, &[0x02]);
        poll(&mut pipeline, 4);

        let (kind, echo, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(kind, 0x33);
        assert_eq!(echo, vec![0x02]);
        assert_eq!(payload, vec![0, 0, 0]);
    }

    #[test]
    fn accumulated_command_reaches_registers() {
        let (mut pipeline, mocks) = board();
        send_command(&mocks, 0x36, &[0x01, 0x0A]);
        poll(&mut pipeline, 5);
        assert_eq!(mocks.registers.read(reg::TRIGGER_MASK_1), 0x0A);
    }

    #[test]
    fn commands_refused_while_trigger_enabled() {
        let (mut pipeline, mocks) = board();
        send_command(&mocks, 0x3B, &[0x01]);
        poll(&mut pipeline, 4);
        assert!(pipeline.arbiter.is_enabled());

        send_command(&mocks, 0x06, &[0x01]);
        poll(&mut pipeline, 4);
        let faults = pipeline.log.drain();
        assert!(faults
            .iter()
            .any(|f| f.code == FaultCode::CommandIgnored && f.value0 == 0x06));

        // The status query still answers mid-run.
        send_command(&mocks, 0x3D, &[]);
        poll(&mut pipeline, 3);
        let (kind, _, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(kind, 0x3D);
        assert_eq!(payload, vec![1]);
    }

    #[test]
    fn end_to_end_trigger_to_event_record() {
        let (mut pipeline, mocks) = board();
        mocks.clock.auto_advance(0);
        mocks.analog.set_values([100, 200, 300, 400, 500, 600]);

        // Detector acknowledges the trigger-enable command at run start.
        mocks.detector.feed(&[4, 0xF1, 0x00, 0x01, 0x65]);
        // Run 320 with detector readout on.
        send_command(&mocks, 0x3C, &[0x01, 0x40, 0x01]);
        poll(&mut pipeline, 5);
        assert!(pipeline.arbiter.is_enabled());
        assert_eq!(pipeline.run_number, 320);

        // Run start zeroed the clock; the trigger fires at tick 1000.
        mocks.clock.set(1000);

        // One correlated timing pair tagged with the trigger tick.
        let handles = pipeline.interrupts();
        handles.tof_a.capture(TofSample::new(100, 5000, 1000).raw, 1000);
        handles.tof_b.capture(TofSample::new(100, 5040, 1000).raw, 1000);
        handles.arbiter.on_trigger_edge();
        assert!(!pipeline.arbiter.is_enabled());

        // Detector: status ready, then a one-board event readout.
        mocks
            .detector
            .feed(&[8, 0xC7, 0x02, 0x00, 0x00, 0x00, 0x57, 0x59, 0x0F]);
        mocks
            .detector
            .feed(&[5, 0xD3, 0x12, 0x34, 0x05, 0x01]);
        mocks.detector.feed(&[4, 0xE7, 0x00, 0xAB, 0xCD]);

        poll(&mut pipeline, 1);

        let (kind, echo, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(kind, 0xDD);
        assert!(echo.is_empty());
        assert_eq!(&payload[0..4], b"ZERO");
        assert_eq!(&payload[4..6], &320u16.to_be_bytes());
        assert_eq!(&payload[6..10], &1u32.to_be_bytes());
        assert_eq!(&payload[10..14], &1000u32.to_be_bytes());
        assert_eq!(&payload[23..25], &100u16.to_be_bytes());
        assert_eq!(&payload[35..37], &40i16.to_be_bytes());
        assert_eq!(&payload[37..39], &0x1234u16.to_be_bytes());
        assert_eq!(payload[41], 1);
        assert_eq!(&payload[44..48], &[0xE7, 0x00, 0xAB, 0xCD]);
        assert_eq!(&payload[payload.len() - 4..], b"FINI");

        // Readout complete: gate re-armed, rings clear, no faults.
        assert!(pipeline.arbiter.is_enabled());
        assert_eq!(pipeline.tof_a.fill_count(), 0);
        assert!(pipeline.log.is_empty());
    }

    #[test]
    fn no_second_event_until_first_ships() {
        let (mut pipeline, mocks) = board();
        send_command(&mocks, 0x3B, &[0x01]);
        poll(&mut pipeline, 4);

        let handles = pipeline.interrupts();
        handles.arbiter.on_trigger_edge();
        handles.arbiter.on_trigger_edge();
        assert_eq!(pipeline.arbiter.raw_count(), 2);
        assert_eq!(pipeline.arbiter.accepted_count(), 1);

        poll(&mut pipeline, 2);
        assert!(pipeline.arbiter.is_enabled());
        assert_eq!(pipeline.arbiter.accepted_count(), 1);
    }

    #[test]
    fn housekeeping_forwards_while_idle() {
        let (mut pipeline, mocks) = board();
        // Passthrough command 0x71 whose answer is a housekeeping packet.
        mocks
            .detector
            .feed(&[8, 0xC7, 0x02, 0x00, 0x09, 0x00, 0x71, 0xAB, 0x0F]);
        send_command(&mocks, 0x10, &[0x00, 0x71, 0x00]);
        poll(&mut pipeline, 6);

        let (kind, _, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(kind, 0xDD);
        assert_eq!(payload, vec![9, 0xC7, 2, 0x00, 0x09, 0x00, 0x71, 0xAB, 0x0F]);
    }

    #[test]
    fn detector_passthrough_returns_echo_payload() {
        let (mut pipeline, mocks) = board();
        mocks.detector.feed(&[4, 0xF1, 0x00, 0x07, 0x0F]);
        // Set layer count to 4; the echo comes back as the response.
        send_command(&mocks, 0x10, &[0x00, 0x0F, 0x01, 0x04]);
        poll(&mut pipeline, 7);

        assert_eq!(pipeline.link.board_count(), 4);
        let (kind, echo, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(kind, 0x10);
        assert_eq!(echo, vec![0x00, 0x0F, 0x01, 0x04]);
        assert_eq!(payload, vec![0x00, 0x07, 0x0F]);
        assert_eq!(&mocks.detector.written()[..], &[0x00, 0x0F, 0x01, 0x04]);
    }

    #[test]
    fn logic_reset_command_reports_clock_then_resets() {
        let (mut pipeline, mocks) = board();
        mocks.clock.auto_advance(0);
        mocks.clock.set(0x0012_3456);
        send_command(&mocks, 0x38, &[]);
        poll(&mut pipeline, 3);

        let (_, _, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(payload, vec![0x12, 0x34, 0x56]);
        assert_eq!(mocks.clock.now(), 0);
    }

    #[test]
    fn read_errors_drains_the_log() {
        let (mut pipeline, mocks) = board();
        pipeline.log.record(FaultCode::AnalogTimeout, 7, 9);
        send_command(&mocks, 0x03, &[]);
        poll(&mut pipeline, 3);

        let (_, _, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(payload, vec![FaultCode::AnalogTimeout as u8, 7, 9]);
        assert!(pipeline.log.is_empty());

        // A second read reports the empty marker.
        mocks.host.clear();
        send_command(&mocks, 0x03, &[]);
        poll(&mut pipeline, 3);
        let (_, _, payload) = parse_envelope(&mocks.host.taken());
        assert_eq!(payload, vec![0x00, 0xEE, 0xFF]);
    }

    #[test]
    fn output_mode_switch_routes_to_sync_link()  {
        let (mut pipeline, mocks) = board();
        send_command(&mocks, 0x30, &[0x00]);
        poll(&mut pipeline, 4);
        send_command(&mocks, 0x07, &[]);
        poll(&mut pipeline, 3);

        assert!(mocks.host.taken().is_empty());
        let (kind, _, payload) = parse_envelope(&mocks.sync.taken());
        assert_eq!(kind, 0x07);
        assert_eq!(payload, vec![crate::FIRMWARE_VERSION]);
    }
}
