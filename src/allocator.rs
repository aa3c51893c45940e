//! Buffer allocation strategies.
//!
//! `BufferAllocator` is the seam between the connection runtime and however
//! its packet buffers are actually backed. The default heap allocator grows
//! without bound. The `static-pool` feature swaps in [`FixedPoolAllocator`],
//! a fixed-count pool that fails closed instead of growing — for hosts that
//! cannot tolerate a runtime allocation failure. The connection runtime is
//! written against the trait and is unaware which strategy is configured.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Default size of a freshly allocated buffer.
const DEFAULT_BUFFER_SIZE: usize = 2048;
/// Buffers larger than this are not returned to the heap pool; they are
/// simply dropped so one oversized packet doesn't permanently inflate the
/// pool's memory footprint.
const MAX_POOLED_BUFFER_SIZE: usize = 16384;
/// Maximum buffers retained by the heap pool.
const MAX_POOLED_BUFFERS: usize = 256;

/// Allocates and frees the byte buffers the connection runtime serializes
/// packets into. `allocate` returns `None` to signal `NO_MEMORY` rather than
/// panicking or growing without limit — the default heap allocator never
/// actually returns `None`, but [`FixedPoolAllocator`] does once its slots
/// are exhausted.
pub trait BufferAllocator: Send + Sync {
    /// Returns a buffer with at least `size` bytes of capacity, or `None` if
    /// none is available.
    fn allocate(&self, size: usize) -> Option<BytesMut>;

    /// Returns a buffer to the allocator for reuse.
    fn free(&self, buf: BytesMut);
}

/// Heap-backed allocator: a pool of reusable buffers that falls back to a
/// fresh heap allocation when the pool is empty. Allocation never fails.
pub struct HeapAllocator {
    pool: ArrayQueue<BytesMut>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            pool: ArrayQueue::new(MAX_POOLED_BUFFERS),
        }
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Option<BytesMut> {
        match self.pool.pop() {
            Some(buf) if buf.capacity() >= size => Some(buf),
            Some(_) => Some(BytesMut::with_capacity(size)),
            None => Some(BytesMut::with_capacity(size.max(DEFAULT_BUFFER_SIZE))),
        }
    }

    fn free(&self, mut buf: BytesMut) {
        if buf.capacity() <= MAX_POOLED_BUFFER_SIZE {
            buf.clear();
            let _ = self.pool.push(buf);
        }
    }
}

/// A fixed-count pool of equal-size slots. Allocation scans for the first
/// free slot; it fails (returns `None`) when the requested size exceeds the
/// slot size or no slot is free — there is no fallback to the heap.
///
/// Each handed-out buffer carries its slot index so `free` can clear and
/// release the exact slot in O(1) instead of an address-matching scan; the
/// O(n) cost is paid once, at allocation time, scanning for a free slot.
pub struct FixedPoolAllocator {
    slot_size: usize,
    slots: Arc<parking_lot::Mutex<Vec<Option<BytesMut>>>>,
}

impl FixedPoolAllocator {
    pub fn new(slot_count: usize, slot_size: usize) -> Self {
        let slots = (0..slot_count).map(|_| Some(BytesMut::new())).collect();
        Self {
            slot_size,
            slots: Arc::new(parking_lot::Mutex::new(slots)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

impl BufferAllocator for FixedPoolAllocator {
    fn allocate(&self, size: usize) -> Option<BytesMut> {
        if size > self.slot_size {
            return None;
        }
        let mut slots = self.slots.lock();
        let index = slots.iter().position(|s| s.is_some())?;
        slots[index] = None;
        Some(BytesMut::with_capacity(self.slot_size))
    }

    fn free(&self, mut buf: BytesMut) {
        buf.clear();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocator_never_fails() {
        let allocator = HeapAllocator::new();
        let buf = allocator.allocate(4096).unwrap();
        assert!(buf.capacity() >= 4096);
        allocator.free(buf);
    }

    #[test]
    fn fixed_pool_fails_when_oversized() {
        let allocator = FixedPoolAllocator::new(4, 128);
        assert!(allocator.allocate(256).is_none());
    }

    #[test]
    fn fixed_pool_fails_when_exhausted() {
        let allocator = FixedPoolAllocator::new(2, 128);
        let a = allocator.allocate(64).unwrap();
        let b = allocator.allocate(64).unwrap();
        assert!(allocator.allocate(64).is_none());
        assert_eq!(allocator.free_slots(), 0);

        allocator.free(a);
        assert_eq!(allocator.free_slots(), 1);
        allocator.free(b);
        assert_eq!(allocator.free_slots(), 2);
    }
}
