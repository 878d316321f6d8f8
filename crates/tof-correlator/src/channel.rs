//! Per-channel capture ring

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Slots per channel. The producing interrupt wraps without back-pressure;
/// unread samples are overwritten oldest-first.
pub const RING_CAPACITY: usize = 64;

const STREAM_CAPACITY: usize = 64;

/// One timing-chip capture: the raw 32-bit shift word plus the coarse clock
/// tag sampled at capture time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TofSample {
    /// Raw capture word: reference counter in the high 16 bits, stop
    /// counter in the low 16.
    pub raw: u32,
    /// Low 16 bits of the tick counter at capture.
    pub tag: u16,
}

impl TofSample {
    pub fn new(reference: u16, stop: u16, tag: u16) -> Self {
        Self {
            raw: (u32::from(reference) << 16) | u32::from(stop),
            tag,
        }
    }

    /// Reference-clock counter at the stop event.
    pub fn reference(&self) -> u16 {
        (self.raw >> 16) as u16
    }

    /// Stop-clock counter within the reference period.
    pub fn stop(&self) -> u16 {
        (self.raw & 0xFFFF) as u16
    }
}

struct Ring {
    slots: [TofSample; RING_CAPACITY],
    filled: [bool; RING_CAPACITY],
    ptr: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            slots: [TofSample::default(); RING_CAPACITY],
            filled: [false; RING_CAPACITY],
            ptr: 0,
        }
    }

    fn clear(&mut self) {
        self.filled = [false; RING_CAPACITY];
        self.ptr = 0;
    }

    /// Index `back` slots behind the write pointer, wrapping.
    fn index_back(&self, back: usize) -> usize {
        (self.ptr + RING_CAPACITY - 1 - back) % RING_CAPACITY
    }
}

/// One capture channel: a fixed ring written from the capture interrupt and
/// drained by the main loop. All multi-step access goes through one lock,
/// the hosted equivalent of the interrupt-masked critical section, and the
/// lock window is kept to the ring update itself.
pub struct TofChannel {
    ring: Mutex<Ring>,
    streaming: AtomicBool,
    streamed: Mutex<VecDeque<TofSample>>,
}

impl TofChannel {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(Ring::new()),
            streaming: AtomicBool::new(false),
            streamed: Mutex::new(VecDeque::new()),
        }
    }

    /// Interrupt-side entry point: store a capture word with its coarse
    /// clock tag, overwriting the oldest slot when the ring has wrapped.
    pub fn capture(&self, raw: u32, tag: u16) {
        let sample = TofSample { raw, tag };
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            let ptr = ring.ptr;
            ring.slots[ptr] = sample;
            ring.filled[ptr] = true;
            ring.ptr = (ptr + 1) % RING_CAPACITY;
        }
        if self.streaming.load(Ordering::Relaxed) {
            let mut streamed = self.streamed.lock().unwrap_or_else(|e| e.into_inner());
            if streamed.len() >= STREAM_CAPACITY {
                streamed.pop_front();
            }
            streamed.push_back(sample);
        }
    }

    /// Reset every filled flag and the write pointer.
    pub fn clear(&self) {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Current write pointer position.
    pub fn write_ptr(&self) -> u8 {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).ptr as u8
    }

    /// Number of filled slots.
    pub fn fill_count(&self) -> u8 {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.filled.iter().filter(|f| **f).count() as u8
    }

    /// Most recent capture, if the slot behind the write pointer is filled,
    /// together with the write pointer itself.
    pub fn latest(&self) -> (Option<TofSample>, u8) {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let idx = ring.index_back(0);
        let sample = ring.filled[idx].then(|| ring.slots[idx]);
        (sample, ring.ptr as u8)
    }

    /// Filled samples whose tag satisfies `pred`, most recent first.
    pub fn candidates(&self, pred: impl Fn(u16) -> bool) -> Vec<TofSample> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for back in 0..RING_CAPACITY {
            let idx = ring.index_back(back);
            if !ring.filled[idx] {
                continue;
            }
            if pred(ring.slots[idx].tag) {
                out.push(ring.slots[idx]);
            }
        }
        out
    }

    /// Drain up to `max` filled samples, most recent first, then clear the
    /// ring. Returns the pre-drain fill count so callers can tell when the
    /// readout was clamped.
    pub fn take_recent(&self, max: usize) -> (u8, Vec<TofSample>) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let total = ring.filled.iter().filter(|f| **f).count() as u8;
        let mut out = Vec::new();
        for back in 0..RING_CAPACITY {
            if out.len() >= max {
                break;
            }
            let idx = ring.index_back(back);
            if ring.filled[idx] {
                out.push(ring.slots[idx]);
            }
        }
        ring.clear();
        (total, out)
    }

    /// Turn capture streaming on or off. Turning it off drops anything not
    /// yet drained.
    pub fn set_streaming(&self, on: bool) {
        self.streaming.store(on, Ordering::Relaxed);
        if !on {
            self.streamed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
    }

    /// Samples captured since the last drain while streaming was on.
    pub fn take_streamed(&self) -> Vec<TofSample> {
        let mut streamed = self.streamed.lock().unwrap_or_else(|e| e.into_inner());
        streamed.drain(..).collect()
    }
}

impl Default for TofChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_splits_reference_and_stop() {
        let sample = TofSample::new(0x1234, 0x5678, 42);
        assert_eq!(sample.raw, 0x1234_5678);
        assert_eq!(sample.reference(), 0x1234);
        assert_eq!(sample.stop(), 0x5678);
    }

    #[test]
    fn ring_overwrites_oldest_past_capacity() {
        let channel = TofChannel::new();
        for i in 0..(RING_CAPACITY as u32 + 10) {
            channel.capture(i, i as u16);
        }
        assert_eq!(channel.fill_count(), RING_CAPACITY as u8);

        let (latest, ptr) = channel.latest();
        assert_eq!(latest.unwrap().raw, RING_CAPACITY as u32 + 9);
        assert_eq!(ptr as usize, 10 % RING_CAPACITY);
    }

    #[test]
    fn candidates_filter_by_tag_most_recent_first() {
        let channel = TofChannel::new();
        channel.capture(1, 100);
        channel.capture(2, 101);
        channel.capture(3, 100);

        let hits = channel.candidates(|tag| tag == 100);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].raw, 3);
        assert_eq!(hits[1].raw, 1);
    }

    #[test]
    fn take_recent_reports_clamp_and_clears() {
        let channel = TofChannel::new();
        for i in 0..30u32 {
            channel.capture(i, 0);
        }
        let (total, samples) = channel.take_recent(21);
        assert_eq!(total, 30);
        assert_eq!(samples.len(), 21);
        assert_eq!(samples[0].raw, 29);
        assert_eq!(channel.fill_count(), 0);
        assert_eq!(channel.write_ptr(), 0);
    }

    #[test]
    fn streaming_collects_only_while_enabled() {
        let channel = TofChannel::new();
        channel.capture(1, 0);
        channel.set_streaming(true);
        channel.capture(2, 0);
        channel.capture(3, 0);
        channel.set_streaming(false);
        channel.capture(4, 0);

        // Disabling dropped the undrained samples.
        assert!(channel.take_streamed().is_empty());

        channel.set_streaming(true);
        channel.capture(5, 7);
        let streamed = channel.take_streamed();
        assert_eq!(streamed.len(), 1);
        assert_eq!(streamed[0].raw, 5);
    }
}
