//! Time-of-Flight Correlator
//!
//! Two timing-converter channels capture stop events asynchronously with
//! respect to the instrument trigger. Each capture lands in a fixed 64-slot
//! ring together with the coarse clock tag current at capture time. Once per
//! trigger the correlator walks both rings, pairs the captures closest in
//! time, and reports the time difference in 10 ps units.

mod channel;
mod correlator;

pub use channel::{TofChannel, TofSample, RING_CAPACITY};
pub use correlator::{Correlation, Correlator, CorrelatorConfig, NO_PAIR_DT, NO_PAIR_WORD};
