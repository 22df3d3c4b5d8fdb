//! Byte allocators backing engine buffers

use bytes::BytesMut;
use pollfs_types::{Allocator, MemoryBlock, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// Allocator that goes straight to the global heap
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<MemoryBlock> {
        Ok(MemoryBlock::new(BytesMut::zeroed(size)))
    }

    fn free(&self, block: MemoryBlock) {
        drop(block);
    }
}

/// Pool hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations served from the free list
    pub hits: u64,
    /// Allocations that went to the heap
    pub misses: u64,
    /// Blocks returned to the free list
    pub recycled: u64,
}

/// Allocator keeping a bounded free list of fixed-capacity blocks
///
/// Requests up to `block_size` bytes are served from the free list when possible;
/// larger requests always go to the heap and are never pooled.
#[derive(Debug)]
pub struct PooledAllocator {
    blocks: Mutex<VecDeque<BytesMut>>,
    block_size: usize,
    max_pool_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    recycled: AtomicU64,
}

impl PooledAllocator {
    /// Create a pool of `block_size` blocks holding at most `max_pool_size` free blocks
    pub fn new(block_size: usize, max_pool_size: usize) -> Self {
        Self {
            blocks: Mutex::new(VecDeque::with_capacity(max_pool_size)),
            block_size,
            max_pool_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    /// Capacity of pooled blocks
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of free blocks currently held
    pub fn pool_size(&self) -> usize {
        self.lock().len()
    }

    /// Drop every free block
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Counters so far
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<BytesMut>> {
        // The free list is always consistent, so a poisoned lock is still usable
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new(64 * 1024, 16)
    }
}

impl Allocator for PooledAllocator {
    fn allocate(&self, size: usize) -> Result<MemoryBlock> {
        if size <= self.block_size {
            if let Some(mut bytes) = self.lock().pop_front() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                bytes.clear();
                bytes.resize(size, 0);
                return Ok(MemoryBlock::new(bytes));
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            let mut bytes = BytesMut::with_capacity(self.block_size);
            bytes.resize(size, 0);
            return Ok(MemoryBlock::new(bytes));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!("Allocation of {} bytes bypasses the pool", size);
        Ok(MemoryBlock::new(BytesMut::zeroed(size)))
    }

    fn free(&self, block: MemoryBlock) {
        let bytes = block.into_inner();
        if bytes.capacity() < self.block_size {
            return;
        }
        let mut blocks = self.lock();
        if blocks.len() < self.max_pool_size {
            blocks.push_back(bytes);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
        // If pool is full, just drop the buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_allocator_zeroed() {
        let allocator = SystemAllocator;
        let block = allocator.allocate(128).unwrap();
        assert_eq!(block.len(), 128);
        assert!(block.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pool_reuses_blocks() {
        let pool = PooledAllocator::new(1024, 2);

        let mut first = pool.allocate(512).unwrap();
        pool.fill(&mut first, 0xFF);
        pool.free(first);
        assert_eq!(pool.pool_size(), 1);

        let second = pool.allocate(256).unwrap();
        assert_eq!(second.len(), 256);
        assert!(second.iter().all(|b| *b == 0));
        assert_eq!(pool.pool_size(), 0);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = PooledAllocator::new(64, 2);
        let blocks: Vec<_> = (0..4).map(|_| pool.allocate(64).unwrap()).collect();
        for block in blocks {
            pool.free(block);
        }
        assert_eq!(pool.pool_size(), 2);
    }

    #[test]
    fn test_large_blocks_bypass_pool() {
        let pool = PooledAllocator::new(64, 4);
        let block = pool.allocate(65).unwrap();
        assert_eq!(pool.size(&block), 65);
        pool.free(block);
        // Large blocks still have enough capacity to be pooled
        assert_eq!(pool.pool_size(), 1);

        pool.clear();
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn test_pooled_aligned_allocation() {
        let pool = PooledAllocator::new(16 * 1024, 4);
        let block = pool.allocate_aligned(4096, 4096).unwrap();
        assert_eq!(block.len(), 4096);
        assert_eq!(block.as_ptr() as usize % 4096, 0);
    }
}
