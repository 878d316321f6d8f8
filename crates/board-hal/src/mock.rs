//! Mock implementations of every hardware seam
//!
//! Used by the test suites of the protocol and pipeline crates and by the
//! bench simulator. No mock sleeps or spins; timing is driven entirely by
//! the injected clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use crate::clock::RealTimeClock;
use crate::peripherals::{AnalogReader, Dac, DacError, I2cBus, I2cError, TofChip, TOF_CONFIG_LEN};
use crate::registers::ControlRegisters;
use crate::serial::{PortError, SerialPort};

/// Register file backed by a plain array.
pub struct MockRegisters {
    regs: Mutex<[u8; 64]>,
}

impl Default for MockRegisters {
    fn default() -> Self {
        Self {
            regs: Mutex::new([0; 64]),
        }
    }
}

impl MockRegisters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControlRegisters for MockRegisters {
    fn read(&self, addr: u8) -> u8 {
        self.regs.lock().unwrap_or_else(|e| e.into_inner())[addr as usize & 0x3F]
    }

    fn write(&self, addr: u8, value: u8) {
        self.regs.lock().unwrap_or_else(|e| e.into_inner())[addr as usize & 0x3F] = value;
    }
}

/// Analog readout with preset channel values and a programmable number of
/// not-ready polls before the conversion-complete flag asserts.
pub struct MockAnalog {
    values: Mutex<[u16; 6]>,
    ready_after: AtomicU32,
}

impl MockAnalog {
    pub fn new() -> Self {
        Self {
            values: Mutex::new([0; 6]),
            ready_after: AtomicU32::new(0),
        }
    }

    pub fn set_values(&self, values: [u16; 6]) {
        *self.values.lock().unwrap_or_else(|e| e.into_inner()) = values;
    }

    /// Report not-ready for the next `polls` calls to `ready`.
    pub fn delay_ready(&self, polls: u32) {
        self.ready_after.store(polls, Ordering::SeqCst);
    }
}

impl Default for MockAnalog {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalogReader for MockAnalog {
    fn ready(&self) -> bool {
        let remaining = self.ready_after.load(Ordering::SeqCst);
        if remaining == 0 {
            true
        } else {
            self.ready_after.store(remaining - 1, Ordering::SeqCst);
            false
        }
    }

    fn read(&self, channel: usize) -> u16 {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(channel).copied().unwrap_or(0)
    }
}

/// DAC that records loads into a map, with an optional stuck-bus mode.
#[derive(Default)]
pub struct MockDac {
    settings: Mutex<HashMap<u8, u16>>,
    fail: AtomicBool,
}

impl MockDac {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Dac for MockDac {
    fn load(&self, address: u8, value: u16) -> Result<(), DacError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DacError::NotResponding(address));
        }
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, value);
        Ok(())
    }

    fn read(&self, address: u8) -> Result<u16, DacError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DacError::NotResponding(address));
        }
        Ok(self
            .settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .copied()
            .unwrap_or(0))
    }
}

/// I2C bus backed by a per-device register map.
#[derive(Default)]
pub struct MockI2c {
    map: Mutex<HashMap<(u8, u8), Vec<u8>>>,
}

impl MockI2c {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(&self, device: u8, reg: u8, bytes: &[u8]) {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((device, reg), bytes.to_vec());
    }
}

impl I2cBus for MockI2c {
    fn read_reg(&self, device: u8, reg: u8, buf: &mut [u8]) -> Result<(), I2cError> {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = map.get(&(device, reg)).ok_or(I2cError::Nack(device))?;
        for (dst, src) in buf.iter_mut().zip(bytes.iter()) {
            *dst = *src;
        }
        Ok(())
    }

    fn write_reg(&self, device: u8, reg: u8, value: u8) -> Result<(), I2cError> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((device, reg), vec![value]);
        Ok(())
    }
}

/// Timing chip that stores its configuration block.
pub struct MockTofChip {
    config: Mutex<[u8; TOF_CONFIG_LEN]>,
    enabled: AtomicBool,
    resets: AtomicU32,
}

impl MockTofChip {
    pub fn new() -> Self {
        Self {
            config: Mutex::new([0; TOF_CONFIG_LEN]),
            enabled: AtomicBool::new(false),
            resets: AtomicU32::new(0),
        }
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl Default for MockTofChip {
    fn default() -> Self {
        Self::new()
    }
}

impl TofChip for MockTofChip {
    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn write_config(&self, config: &[u8; TOF_CONFIG_LEN]) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = *config;
    }

    fn read_config(&self) -> [u8; TOF_CONFIG_LEN] {
        *self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }
}

/// RTC pinned to a settable instant.
pub struct FixedRtc {
    value: Mutex<DateTime<Utc>>,
}

impl FixedRtc {
    pub fn new(value: DateTime<Utc>) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Midnight on 2024-01-01, a convenient default for tests.
    pub fn epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }
}

impl RealTimeClock for FixedRtc {
    fn read(&self) -> DateTime<Utc> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, value: DateTime<Utc>) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

struct Channel {
    queue: Mutex<VecDeque<u8>>,
}

impl Channel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
        })
    }
}

/// One end of an in-memory full-duplex serial connection.
///
/// `LoopbackPort::pair()` returns two connected ends; bytes written to one
/// appear on the other. Transmission is instantaneous, so `tx_pending` is
/// always zero.
pub struct LoopbackPort {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
}

impl LoopbackPort {
    pub fn pair() -> (Self, Self) {
        let a = Channel::new();
        let b = Channel::new();
        (
            Self {
                rx: Arc::clone(&a),
                tx: Arc::clone(&b),
            },
            Self { rx: b, tx: a },
        )
    }
}

impl SerialPort for LoopbackPort {
    fn try_read(&self) -> Option<u8> {
        self.rx
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn write(&self, byte: u8) -> Result<(), PortError> {
        self.tx
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(byte);
        Ok(())
    }

    fn tx_pending(&self) -> usize {
        0
    }

    fn clear_rx(&self) {
        self.rx
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Port with canned receive bytes and recorded transmit bytes.
///
/// `stall_tx` makes `tx_pending` report a stuck transmitter so timeout
/// paths can be exercised.
#[derive(Default)]
pub struct ScriptedPort {
    rx: Mutex<VecDeque<u8>>,
    tx: Mutex<Vec<u8>>,
    stall_tx: AtomicBool,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the receive queue.
    pub fn feed(&self, bytes: &[u8]) {
        self.rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(bytes.iter().copied());
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drop recorded transmit bytes.
    pub fn clear_written(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn stall_tx(&self, stall: bool) {
        self.stall_tx.store(stall, Ordering::SeqCst);
    }

    pub fn rx_remaining(&self) -> usize {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl SerialPort for ScriptedPort {
    fn try_read(&self) -> Option<u8> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn write(&self, byte: u8) -> Result<(), PortError> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).push(byte);
        Ok(())
    }

    fn tx_pending(&self) -> usize {
        if self.stall_tx.load(Ordering::SeqCst) {
            1
        } else {
            0
        }
    }

    fn clear_rx(&self) {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
