//! Monotonic tick clock and real-time clock seams

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

/// Monotonic time in 5 ms ticks.
pub type Tick = u32;

/// Length of one tick in milliseconds.
pub const TICK_MS: u64 = 5;

/// Monotonic board clock.
///
/// All timeout loops in the acquisition core poll this; tests drive a
/// [`ManualClock`] so no test ever sleeps.
pub trait Clock: Send + Sync {
    /// Current tick count.
    fn now(&self) -> Tick;

    /// Reset the count to zero (logic reset, run start).
    fn reset(&self);
}

/// Shared handle to a board clock.
pub type SharedClock = Arc<dyn Clock>;

/// Manually advanced clock for tests and the simulator.
///
/// With `auto_advance` set, every `now` call also steps the count, so
/// bounded polling loops observe elapsing time without any real delay.
#[derive(Default)]
pub struct ManualClock {
    ticks: AtomicU32,
    auto: AtomicU32,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `n` ticks.
    pub fn advance(&self, n: Tick) {
        self.ticks.fetch_add(n, Ordering::SeqCst);
    }

    pub fn set(&self, ticks: Tick) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    /// Step the count by `n` on every `now` call.
    pub fn auto_advance(&self, n: Tick) {
        self.auto.store(n, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        let auto = self.auto.load(Ordering::SeqCst);
        if auto > 0 {
            self.ticks.fetch_add(auto, Ordering::SeqCst);
        }
        self.ticks.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.ticks.store(0, Ordering::SeqCst);
    }
}

/// Wall-time backed clock, one tick per 5 ms of elapsed time.
pub struct WallClock {
    start: Mutex<Instant>,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            start: Mutex::new(Instant::now()),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> Tick {
        let start = self.start.lock().unwrap_or_else(|e| e.into_inner());
        (start.elapsed().as_millis() as u64 / TICK_MS) as Tick
    }

    fn reset(&self) {
        let mut start = self.start.lock().unwrap_or_else(|e| e.into_inner());
        *start = Instant::now();
    }
}

/// Battery-backed date/time source.
pub trait RealTimeClock: Send + Sync {
    fn read(&self) -> DateTime<Utc>;
    fn write(&self, value: DateTime<Utc>);
}

/// Shared handle to a real-time clock.
pub type SharedRtc = Arc<dyn RealTimeClock>;

/// System-time RTC with a settable offset.
pub struct SystemRtc {
    offset: Mutex<Duration>,
}

impl Default for SystemRtc {
    fn default() -> Self {
        Self {
            offset: Mutex::new(Duration::zero()),
        }
    }
}

impl RealTimeClock for SystemRtc {
    fn read(&self) -> DateTime<Utc> {
        let offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        Utc::now() + *offset
    }

    fn write(&self, value: DateTime<Utc>) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset = value - Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_resets() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0);
        clock.advance(37);
        assert_eq!(clock.now(), 37);
        clock.reset();
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn system_rtc_honors_written_time() {
        let rtc = SystemRtc::default();
        let target = Utc::now() - Duration::days(400);
        rtc.write(target);
        let read = rtc.read();
        assert!((read - target).num_seconds().abs() < 2);
    }
}
