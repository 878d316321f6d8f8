//! Raw block queue between the receive interrupt and the main loop

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use error_log::{ErrorLog, FaultCode};

use crate::frame::BLOCK_LEN;

/// Pending blocks held before the main loop drains them.
pub const QUEUE_CAPACITY: usize = 32;

struct Inner {
    blocks: VecDeque<[u8; BLOCK_LEN]>,
    partial: [u8; BLOCK_LEN],
    partial_len: usize,
}

/// Fixed ring of pending 29-byte command blocks.
///
/// `push_byte` is the interrupt-side entry point; a completed block is
/// dropped with an overflow fault when the ring is already full, never
/// overwriting queued commands.
pub struct CommandQueue {
    inner: Mutex<Inner>,
    log: Arc<ErrorLog>,
}

impl CommandQueue {
    pub fn new(log: Arc<ErrorLog>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: VecDeque::with_capacity(QUEUE_CAPACITY),
                partial: [0; BLOCK_LEN],
                partial_len: 0,
            }),
            log,
        }
    }

    /// Append one received byte to the block being assembled.
    pub fn push_byte(&self, byte: u8) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let len = inner.partial_len;
        inner.partial[len] = byte;
        inner.partial_len = len + 1;
        if inner.partial_len == BLOCK_LEN {
            inner.partial_len = 0;
            if inner.blocks.len() >= QUEUE_CAPACITY {
                let pending = inner.blocks.len() as u8;
                drop(inner);
                self.log.record(FaultCode::CommandOverflow, pending, 0);
            } else {
                let block = inner.partial;
                inner.blocks.push_back(block);
            }
        }
    }

    /// Take the oldest complete block.
    pub fn pop_block(&self) -> Option<[u8; BLOCK_LEN]> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .blocks
            .pop_front()
    }

    /// Complete blocks waiting.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .blocks
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_block;

    #[test]
    fn blocks_come_out_in_arrival_order() {
        let queue = CommandQueue::new(Arc::new(ErrorLog::new()));
        for data in [0x01u8, 0x02, 0x03] {
            for byte in encode_block(data, 0x20) {
                queue.push_byte(byte);
            }
        }
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.pop_block().unwrap()[1], b'0');
        let second = queue.pop_block().unwrap();
        assert_eq!(second[2], b'2');
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn overflow_drops_block_and_logs() {
        let log = Arc::new(ErrorLog::new());
        let queue = CommandQueue::new(Arc::clone(&log));
        for i in 0..(QUEUE_CAPACITY as u8 + 1) {
            for byte in encode_block(i, 0) {
                queue.push_byte(byte);
            }
        }
        assert_eq!(queue.pending(), QUEUE_CAPACITY);
        let faults = log.drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, FaultCode::CommandOverflow);
    }
}
