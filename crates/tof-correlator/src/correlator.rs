//! Trigger-correlated nearest-match search

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{TofChannel, TofSample};

/// Time-difference sentinel when no pair fell inside the match window.
/// Doubles as the starting bound of the minimum search, so only pairs with
/// a smaller magnitude are ever reported.
pub const NO_PAIR_DT: i32 = 32767;

/// Sentinel for the diagnostic clock and reference fields.
pub const NO_PAIR_WORD: u16 = 65535;

/// Correlator tuning.
///
/// `rollover_correction` compensates a reference-counter wrap between the
/// two captures. Its value does not equal the theoretical full-scale
/// product of the counter range and `tick_constant`; it is carried as a
/// named setting pending hardware characterization rather than recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Stop-clock counts per reference-clock period (10 ps units).
    pub tick_constant: u32,
    /// Reference count above which a channel sits near the counter top.
    pub rollover_high: u16,
    /// Reference count below which a channel sits near the counter bottom.
    pub rollover_low: u16,
    /// Correction applied when one channel wrapped, in 10 ps units.
    pub rollover_correction: i64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            tick_constant: 8333,
            rollover_high: 49152,
            rollover_low: 16384,
            rollover_correction: 500_000_000,
        }
    }
}

/// Outcome of one correlation pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Correlation {
    /// Best time difference, channel B minus channel A, in 10 ps units.
    /// [`NO_PAIR_DT`] when no valid pair existed.
    pub dt: i32,
    /// Channel A captures inside the trigger window.
    pub a_candidates: u8,
    /// Channel B captures inside the trigger window.
    pub b_candidates: u8,
    /// Coarse clock tag of the winning channel A capture.
    pub a_clk: u16,
    /// Coarse clock tag of the winning channel B capture.
    pub b_clk: u16,
    /// Reference counter of the winning channel A capture.
    pub a_ref: u16,
    /// Reference counter of the winning channel B capture.
    pub b_ref: u16,
}

impl Correlation {
    fn no_pair(a_candidates: u8, b_candidates: u8) -> Self {
        Self {
            dt: NO_PAIR_DT,
            a_candidates,
            b_candidates,
            a_clk: NO_PAIR_WORD,
            b_clk: NO_PAIR_WORD,
            a_ref: NO_PAIR_WORD,
            b_ref: NO_PAIR_WORD,
        }
    }

    /// Whether a correlated pair was found.
    pub fn found_pair(&self) -> bool {
        self.a_clk != NO_PAIR_WORD
    }

    /// The time difference as the 16-bit wire value.
    pub fn dt_wire(&self) -> i16 {
        self.dt as i16
    }
}

/// Pairs the two asynchronous capture channels against a trigger timestamp.
pub struct Correlator {
    config: CorrelatorConfig,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self { config }
    }

    /// Find the best-correlated pair for the trigger's coarse clock tag,
    /// then clear both rings. Samples not consulted this cycle are
    /// discarded so each cycle does bounded work with no backlog.
    pub fn correlate(&self, a: &TofChannel, b: &TofChannel, trigger_tag: u16) -> Correlation {
        let t = trigger_tag;
        let ia = a.candidates(|tag| tag == t || tag.wrapping_add(1) == t);
        let jb = b.candidates(|tag| tag == t || tag == t.wrapping_sub(1));

        let mut best = Correlation::no_pair(ia.len() as u8, jb.len() as u8);
        let mut dt_min: i64 = i64::from(NO_PAIR_DT);

        for sample_b in &jb {
            let time_b = self.fine_time(sample_b);
            for sample_a in &ia {
                // The two channels must land within one coarse clock period
                // of each other.
                if (i32::from(sample_a.tag) - i32::from(sample_b.tag)).abs() > 1 {
                    continue;
                }
                let time_a = self.fine_time(sample_a);
                let dt = self.delta(sample_a, sample_b, time_a, time_b);
                if dt.abs() < dt_min.abs() {
                    dt_min = dt;
                    best.dt = dt as i32;
                    best.a_clk = sample_a.tag;
                    best.b_clk = sample_b.tag;
                    best.a_ref = sample_a.reference();
                    best.b_ref = sample_b.reference();
                }
            }
        }

        a.clear();
        b.clear();

        debug!(
            trigger_tag,
            a_candidates = best.a_candidates,
            b_candidates = best.b_candidates,
            dt = best.dt,
            "correlation pass"
        );
        best
    }

    fn fine_time(&self, sample: &TofSample) -> i64 {
        i64::from(sample.reference()) * i64::from(self.config.tick_constant)
            + i64::from(sample.stop())
    }

    /// B minus A, correcting for a reference-counter wrap when one channel
    /// sits near the counter top and the other near the bottom.
    fn delta(&self, a: &TofSample, b: &TofSample, time_a: i64, time_b: i64) -> i64 {
        let high = self.config.rollover_high;
        let low = self.config.rollover_low;
        if a.reference() > high && b.reference() < low {
            time_b - (time_a - self.config.rollover_correction)
        } else if b.reference() > high && a.reference() < low {
            (time_b - self.config.rollover_correction) - time_a
        } else {
            time_b - time_a
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(CorrelatorConfig::default())
    }
}
