//! Receive-buffer allocation.
//!
//! Every read on a socket fills a freshly allocated buffer which is then
//! handed to the owner's `received` callback, so the allocator is the one
//! place that decides receive capacity.

use bytes::BytesMut;

/// Opaque factory for receive buffers with a pluggable capacity policy.
pub trait BufferAllocator: Send + Sync {
    /// Returns a zero-initialized buffer; its length is the read capacity.
    fn allocate(&self) -> BytesMut;
}

/// Allocates fixed-size buffers.
#[derive(Debug, Clone, Copy)]
pub struct FixedAllocator {
    capacity: usize,
}

impl FixedAllocator {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "receive buffer capacity must be non-zero");
        FixedAllocator { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for FixedAllocator {
    fn default() -> Self {
        FixedAllocator::new(8192)
    }
}

impl BufferAllocator for FixedAllocator {
    fn allocate(&self) -> BytesMut {
        BytesMut::zeroed(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_requested_capacity() {
        let alloc = FixedAllocator::new(512);
        let buf = alloc.allocate();
        assert_eq!(buf.len(), 512);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic]
    fn rejects_zero_capacity() {
        FixedAllocator::new(0);
    }
}
