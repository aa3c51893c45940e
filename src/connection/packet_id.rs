//! Packet identifier allocation.
//!
//! MQTT packet identifiers are 16-bit and must be unique among the
//! currently in-flight operations on a connection; 0 is reserved and never
//! handed out. Allocation is serialized by the caller holding the
//! connection's state lock, so packet-id assignment never races with itself.

use std::sync::atomic::{AtomicU16, Ordering};

/// Monotonic 16-bit packet identifier generator that skips zero and wraps.
pub struct PacketIdAllocator {
    next: AtomicU16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }

    /// Returns the next identifier, skipping 0 on wraparound.
    pub fn allocate(&self) -> u16 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
            // fetch_add just wrapped to 0; the *next* call would return 1
            // correctly, but this call must still hand back a nonzero id.
        }
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequentially_starting_at_one() {
        let alloc = PacketIdAllocator::new();
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 3);
    }

    #[test]
    fn never_hands_out_zero_across_wraparound() {
        let alloc = PacketIdAllocator::new();
        alloc.next.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(alloc.allocate(), u16::MAX);
        assert_eq!(alloc.allocate(), 1);
    }
}
