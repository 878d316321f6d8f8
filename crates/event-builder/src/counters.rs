//! Singles-rate counters
//!
//! Each discriminator channel increments a 16-bit software counter from its
//! rate interrupt whenever the 8-bit hardware counter turns over. Live and
//! end-of-cycle values are both readable by command; the saved set lets the
//! ground system compute rates for the cycle that just shipped.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use board_hal::{reg, ControlRegisters};

/// Discriminator channels with singles counting.
pub const CHANNELS: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
struct Saved {
    count: u16,
    hardware: u8,
}

/// Software overflow counters plus an end-of-cycle snapshot.
pub struct SinglesCounters {
    counts: [AtomicU16; CHANNELS],
    saved: Mutex<[Saved; CHANNELS]>,
    regs: Arc<dyn ControlRegisters>,
}

impl SinglesCounters {
    pub fn new(regs: Arc<dyn ControlRegisters>) -> Self {
        Self {
            counts: Default::default(),
            saved: Mutex::new([Saved::default(); CHANNELS]),
            regs,
        }
    }

    /// Interrupt-side: one hardware-counter turnover on `channel` (1-based).
    pub fn increment(&self, channel: usize) {
        if let Some(count) = self.counts.get(channel.wrapping_sub(1)) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Live value: software counter and hardware counter register.
    pub fn live(&self, channel: usize) -> (u16, u8) {
        let index = channel.wrapping_sub(1);
        if index >= CHANNELS {
            return (0, 0);
        }
        let count = self.counts[index].load(Ordering::Relaxed);
        let hardware = self.regs.read(reg::SINGLES_BASE + index as u8);
        (count, hardware)
    }

    /// End-of-cycle snapshot of every channel.
    pub fn save_snapshot(&self) {
        let mut saved = self.saved.lock().unwrap_or_else(|e| e.into_inner());
        for (index, slot) in saved.iter_mut().enumerate() {
            slot.count = self.counts[index].load(Ordering::Relaxed);
            slot.hardware = self.regs.read(reg::SINGLES_BASE + index as u8);
        }
    }

    /// Saved value from the last snapshot.
    pub fn saved(&self, channel: usize) -> (u16, u8) {
        let index = channel.wrapping_sub(1);
        let saved = self.saved.lock().unwrap_or_else(|e| e.into_inner());
        match saved.get(index) {
            Some(slot) => (slot.count, slot.hardware),
            None => (0, 0),
        }
    }

    /// Zero the software counters (run start, logic reset).
    pub fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }
}
