//! Event Builder
//!
//! One full assembly cycle per accepted trigger: wait for the analog
//! conversions, read the detector, correlate the timing channels, and
//! serialize the fixed-layout event record. Every failure path degrades
//! the record instead of stalling the loop; the trigger is re-armed by the
//! main loop only after the record has shipped.

mod arbiter;
mod builder;
mod counters;
mod record;

pub use arbiter::{TriggerArbiter, TriggerSnapshot};
pub use builder::{BuilderConfig, EventBuilder};
pub use counters::SinglesCounters;
pub use record::{
    pack_datetime, serialize_detector_only, serialize_event, EventHeader, ANALOG_CHANNELS,
    EVENT_MARKER, EVENT_TRAILER, MAX_EVENT_BYTES,
};
