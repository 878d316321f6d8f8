//! Trigger gate and latch

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use board_hal::{reg, Clock, ControlRegisters, SharedClock};

/// State captured at the trigger edge for the cycle in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSnapshot {
    /// Tick count at the edge.
    pub timestamp: u32,
    /// Trigger status flags latched by the hardware.
    pub status: u8,
}

/// Owns the trigger enable state and reacts to the trigger edge.
///
/// `on_trigger_edge` is the interrupt-side entry point: with the gate open
/// it latches a snapshot and closes the gate, so no second trigger can be
/// accepted until the main loop finishes the readout and re-arms. The raw
/// counter counts every edge regardless.
pub struct TriggerArbiter {
    regs: Arc<dyn ControlRegisters>,
    clock: SharedClock,
    raw: AtomicU32,
    accepted: AtomicU32,
    latched: Mutex<Option<TriggerSnapshot>>,
}

impl TriggerArbiter {
    pub fn new(regs: Arc<dyn ControlRegisters>, clock: SharedClock) -> Self {
        Self {
            regs,
            clock,
            raw: AtomicU32::new(0),
            accepted: AtomicU32::new(0),
            latched: Mutex::new(None),
        }
    }

    /// Whether the master trigger gate is open.
    pub fn is_enabled(&self) -> bool {
        self.regs.read(reg::TRIGGER_CTRL) & reg::TRIGGER_ENABLE_MASK != 0
    }

    /// Open or close the master trigger gate.
    pub fn set_enabled(&self, enabled: bool) {
        debug!(enabled, "trigger gate");
        self.regs
            .update(reg::TRIGGER_CTRL, reg::TRIGGER_ENABLE_MASK, enabled);
    }

    /// Interrupt-side: the trigger edge fired.
    pub fn on_trigger_edge(&self) {
        if self.is_enabled() {
            self.set_enabled(false);
            let snapshot = TriggerSnapshot {
                timestamp: self.clock.now(),
                status: self.regs.read(reg::TRIGGER_STATUS),
            };
            self.accepted.fetch_add(1, Ordering::SeqCst);
            *self.latched.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        }
        self.raw.fetch_add(1, Ordering::SeqCst);
    }

    /// Take the latched snapshot, if a trigger is awaiting readout.
    pub fn take_latched(&self) -> Option<TriggerSnapshot> {
        self.latched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Drop a latched trigger without reading it out (end of run).
    pub fn discard_latched(&self) {
        let _ = self.take_latched();
    }

    /// Every edge seen this run, including while the gate was closed.
    pub fn raw_count(&self) -> u32 {
        self.raw.load(Ordering::SeqCst)
    }

    /// Edges that latched a readout.
    pub fn accepted_count(&self) -> u32 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Zero both counters (run start, logic reset).
    pub fn reset_counts(&self) {
        self.raw.store(0, Ordering::SeqCst);
        self.accepted.store(0, Ordering::SeqCst);
    }
}
