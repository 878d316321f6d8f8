//! Peripheral seams: analog readout, DACs, I2C devices, timing chip

use thiserror::Error;

/// Length of the timing chip's configuration block.
pub const TOF_CONFIG_LEN: usize = 17;

/// DAC error types
#[derive(Debug, Error)]
pub enum DacError {
    #[error("DAC 0x{0:02X} not responding")]
    NotResponding(u8),

    #[error("DAC bus error: {0}")]
    Bus(u8),
}

/// I2C error types
#[derive(Debug, Error)]
pub enum I2cError {
    #[error("no acknowledge from device 0x{0:02X}")]
    Nack(u8),

    #[error("bus error: {0}")]
    Bus(u8),
}

/// Digitized pulse-height readout.
///
/// Conversions start from the trigger edge in hardware; `ready` reports the
/// conversion-complete flag the event builder polls before reading.
pub trait AnalogReader: Send + Sync {
    /// Conversion-complete flag.
    fn ready(&self) -> bool;

    /// Read the latest conversion for one of the six channels.
    fn read(&self, channel: usize) -> u16;
}

/// Threshold DAC access, both the on-board 8-bit DACs and the external
/// 12-bit parts.
pub trait Dac: Send + Sync {
    fn load(&self, address: u8, value: u16) -> Result<(), DacError>;
    fn read(&self, address: u8) -> Result<u16, DacError>;
}

/// Register access to the monitoring devices on the I2C bus: power
/// monitors, the temperature sensor, the barometer, and the external RTC.
pub trait I2cBus: Send + Sync {
    fn read_reg(&self, device: u8, reg: u8, buf: &mut [u8]) -> Result<(), I2cError>;
    fn write_reg(&self, device: u8, reg: u8, value: u8) -> Result<(), I2cError>;
}

/// Configuration surface of the time-of-flight converter chip.
pub trait TofChip: Send + Sync {
    /// Power-on reset.
    fn reset(&self);

    /// Load the full configuration block.
    fn write_config(&self, config: &[u8; TOF_CONFIG_LEN]);

    /// Read the configuration block back.
    fn read_config(&self) -> [u8; TOF_CONFIG_LEN];

    /// Start accepting stop events on both channels.
    fn enable(&self);
}
