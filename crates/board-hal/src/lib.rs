//! Hardware Abstraction Layer for the event DAQ board
//!
//! The acquisition core never touches buses or peripherals directly. It sees
//! a small set of traits: a monotonic tick clock, byte-oriented serial ports,
//! a control/status register file, the analog readout, and a handful of
//! configuration peripherals (DACs, I2C devices, the timing chip). Every
//! trait ships with a mock implementation so the full pipeline runs in tests
//! and in the bench simulator without hardware.

mod clock;
mod mock;
mod peripherals;
mod registers;
mod serial;

pub use clock::{
    Clock, ManualClock, RealTimeClock, SharedClock, SharedRtc, SystemRtc, Tick, WallClock, TICK_MS,
};
pub use mock::{
    FixedRtc, LoopbackPort, MockAnalog, MockDac, MockI2c, MockRegisters, MockTofChip, ScriptedPort,
};
pub use peripherals::{AnalogReader, Dac, DacError, I2cBus, I2cError, TofChip, TOF_CONFIG_LEN};
pub use registers::{reg, ControlRegisters};
pub use serial::{PortError, SerialPort, SharedPort};
