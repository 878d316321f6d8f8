//! Detector Link
//!
//! Byte-framed request/response protocol to the tracking detector's board
//! stack over a dedicated serial channel. Every read is a bounded tick
//! poll; every malformed input has a recovery that leaves the link aligned
//! and the event cycle able to proceed with a well-formed, possibly
//! degraded, payload.

mod arena;
mod link;
mod packet;

pub use arena::{HitArena, MAX_BOARDS, MAX_BOARD_BYTES};
pub use link::{DetectorConfig, DetectorLink, PacketOutcome, ECHO_LESS};
pub use packet::{
    placeholder, type_code, DetectorEvent, Expected, Housekeeping, HOUSEKEEPING_CAPACITY,
    PLACEHOLDER_LEN,
};
