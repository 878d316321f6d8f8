//! Board I/O bundle
//!
//! Gathers every hardware seam the pipeline needs. Real deployments wire
//! the driver-backed implementations here; tests and the simulator use
//! [`BoardIo::mock`], which also hands back the concrete mock handles for
//! scripting.

use std::sync::Arc;

use board_hal::{
    AnalogReader, ControlRegisters, Dac, FixedRtc, I2cBus, LoopbackPort, ManualClock, MockAnalog,
    MockDac, MockI2c, MockRegisters, MockTofChip, ScriptedPort, SharedClock, SharedPort, SharedRtc,
    TofChip,
};
use output_framer::{MemoryTransport, Transport};

/// Every seam the acquisition pipeline touches.
pub struct BoardIo {
    pub clock: SharedClock,
    pub rtc: SharedRtc,
    pub registers: Arc<dyn ControlRegisters>,
    pub analog: Arc<dyn AnalogReader>,
    pub dac: Arc<dyn Dac>,
    pub i2c: Arc<dyn I2cBus>,
    pub tof_chip: Arc<dyn TofChip>,
    /// Command input line.
    pub command_port: SharedPort,
    /// Detector front-end link.
    pub detector_port: SharedPort,
    /// Host serial transport (bench and debug).
    pub host: Arc<dyn Transport>,
    /// Synchronous inter-board transport (flight).
    pub sync: Arc<dyn Transport>,
}

/// Concrete mock handles for driving a mock [`BoardIo`] from tests or the
/// simulator.
pub struct MockBoard {
    pub clock: Arc<ManualClock>,
    pub rtc: Arc<FixedRtc>,
    pub registers: Arc<MockRegisters>,
    pub analog: Arc<MockAnalog>,
    pub dac: Arc<MockDac>,
    pub i2c: Arc<MockI2c>,
    pub tof_chip: Arc<MockTofChip>,
    /// Far end of the command line: write command blocks here.
    pub ground: LoopbackPort,
    /// Detector side of the link: script packets here.
    pub detector: Arc<ScriptedPort>,
    pub host: Arc<MemoryTransport>,
    pub sync: Arc<MemoryTransport>,
}

impl BoardIo {
    /// A fully mocked board. The manual clock auto-advances one tick per
    /// reading so bounded polls always terminate.
    pub fn mock() -> (Self, MockBoard) {
        let clock = Arc::new(ManualClock::new());
        clock.auto_advance(1);
        let rtc = Arc::new(FixedRtc::epoch());
        let registers = Arc::new(MockRegisters::new());
        let analog = Arc::new(MockAnalog::new());
        let dac = Arc::new(MockDac::new());
        let i2c = Arc::new(MockI2c::new());
        let tof_chip = Arc::new(MockTofChip::new());
        let (board_end, ground) = LoopbackPort::pair();
        let detector = Arc::new(ScriptedPort::new());
        let host = Arc::new(MemoryTransport::new(64));
        let sync = Arc::new(MemoryTransport::new(64));

        let io = BoardIo {
            clock: Arc::clone(&clock) as SharedClock,
            rtc: Arc::clone(&rtc) as SharedRtc,
            registers: Arc::clone(&registers) as Arc<dyn ControlRegisters>,
            analog: Arc::clone(&analog) as Arc<dyn AnalogReader>,
            dac: Arc::clone(&dac) as Arc<dyn Dac>,
            i2c: Arc::clone(&i2c) as Arc<dyn I2cBus>,
            tof_chip: Arc::clone(&tof_chip) as Arc<dyn TofChip>,
            command_port: Arc::new(board_end) as SharedPort,
            detector_port: Arc::clone(&detector) as SharedPort,
            host: Arc::clone(&host) as Arc<dyn Transport>,
            sync: Arc::clone(&sync) as Arc<dyn Transport>,
        };
        let mocks = MockBoard {
            clock,
            rtc,
            registers,
            analog,
            dac,
            i2c,
            tof_chip,
            ground,
            detector,
            host,
            sync,
        };
        (io, mocks)
    }
}
