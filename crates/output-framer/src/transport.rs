//! Outbound byte transport seam

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Transport error types
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not ready")]
    NotReady,

    #[error("transport closed")]
    Closed,
}

/// A chunk-oriented outbound transport: the host serial link or the
/// synchronous inter-board link, both driven by external drivers.
pub trait Transport: Send + Sync {
    /// Whether the next chunk can be accepted now.
    fn ready(&self) -> bool;

    /// Write one chunk, at most `max_chunk` bytes.
    fn write(&self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Largest chunk the transport accepts per write.
    fn max_chunk(&self) -> usize;

    /// Reinitialize the transport hardware. Default: nothing to do.
    fn reinit(&self) {}
}

/// In-memory transport capturing everything written, with a programmable
/// number of not-ready polls before each accepted chunk.
pub struct MemoryTransport {
    bytes: Mutex<Vec<u8>>,
    max_chunk: usize,
    busy_polls: AtomicU32,
    reinits: AtomicU32,
}

impl MemoryTransport {
    pub fn new(max_chunk: usize) -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
            max_chunk,
            busy_polls: AtomicU32::new(0),
            reinits: AtomicU32::new(0),
        }
    }

    /// Report not-ready for the next `polls` readiness checks.
    pub fn set_busy(&self, polls: u32) {
        self.busy_polls.store(polls, Ordering::SeqCst);
    }

    /// Report not-ready forever, for timeout tests.
    pub fn stall(&self) {
        self.busy_polls.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn taken(&self) -> Vec<u8> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn reinit_count(&self) -> u32 {
        self.reinits.load(Ordering::SeqCst)
    }

    /// Record of chunk boundaries is not kept; tests assert on the byte
    /// stream, which is what the wire carries.
    fn push(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(chunk);
    }
}

impl Transport for MemoryTransport {
    fn ready(&self) -> bool {
        let busy = self.busy_polls.load(Ordering::SeqCst);
        if busy == 0 {
            return true;
        }
        if busy != u32::MAX {
            self.busy_polls.store(busy - 1, Ordering::SeqCst);
        }
        false
    }

    fn write(&self, chunk: &[u8]) -> Result<(), TransportError> {
        self.push(chunk);
        Ok(())
    }

    fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    fn reinit(&self) {
        self.reinits.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_polls_count_down() {
        let transport = MemoryTransport::new(64);
        transport.set_busy(2);
        assert!(!transport.ready());
        assert!(!transport.ready());
        assert!(transport.ready());
    }

    #[test]
    fn writes_accumulate() {
        let transport = MemoryTransport::new(64);
        transport.write(&[1, 2]).unwrap();
        transport.write(&[3]).unwrap();
        assert_eq!(transport.taken(), vec![1, 2, 3]);
    }
}
