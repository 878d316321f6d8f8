//! Command Channel
//!
//! Commands reach the board as 29-byte blocks: three identical copies of a
//! 9-byte ASCII frame plus a two-byte terminator. This crate queues raw
//! blocks from the receive interrupt, recovers the frame by majority vote,
//! runs the multi-byte accumulation state machine, and produces typed
//! [`Command`] values for dispatch.

mod assembler;
mod command;
mod frame;
mod queue;

pub use assembler::{CommandAssembler, RawCommand, ACCUMULATION_TIMEOUT};
pub use command::Command;
pub use frame::{
    address_byte, encode_block, majority_vote, parse_frame, FrameFields, BLOCK_LEN, BOARD_ADDRESS,
    FRAME_LEN,
};
pub use queue::{CommandQueue, QUEUE_CAPACITY};
