//! # Allocation Reuse Pool
//!
//! Retired heaps and instruction buffers waiting for the device timeline.
//!
//! An allocation is parked with the last task count that may reference it
//! and only handed out again once the queue's completed task count has
//! reached that value.

use alloc::sync::Arc;
use alloc::vec::Vec;

use caldera_core::{AllocUsage, DeviceAllocation, DeviceMemoryAllocator};

/// Default number of completed allocations kept for recycling
pub const DEFAULT_CACHE_LIMIT: usize = 8;

/// A parked allocation
#[derive(Debug)]
struct ReuseEntry {
    memory: DeviceAllocation,
    task_count: u64,
}

/// Reuse pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReuseStats {
    /// Allocations parked
    pub parked: u64,
    /// Allocations handed out again
    pub recycled: u64,
    /// Allocations returned to the device allocator
    pub freed: u64,
}

/// Timeline-safe pool of retired allocations
pub struct ReusePool {
    allocator: Arc<dyn DeviceMemoryAllocator>,
    entries: Vec<ReuseEntry>,
    cache_limit: usize,
    stats: ReuseStats,
}

impl ReusePool {
    /// Create an empty pool that frees through `allocator`
    pub fn new(allocator: Arc<dyn DeviceMemoryAllocator>) -> Self {
        Self::with_limit(allocator, DEFAULT_CACHE_LIMIT)
    }

    /// Create an empty pool keeping at most `cache_limit` completed entries
    pub fn with_limit(allocator: Arc<dyn DeviceMemoryAllocator>, cache_limit: usize) -> Self {
        Self {
            allocator,
            entries: Vec::new(),
            cache_limit,
            stats: ReuseStats::default(),
        }
    }

    /// Park `memory` until the device completes `task_count`
    pub fn release(&mut self, memory: DeviceAllocation, task_count: u64) {
        log::debug!(
            "reuse pool: parking {:?} {} until task {}",
            memory.usage(),
            memory.size(),
            task_count
        );
        self.entries.push(ReuseEntry { memory, task_count });
        self.stats.parked += 1;
    }

    /// Take the smallest completed allocation of `usage` holding `min_size`
    pub fn obtain(
        &mut self,
        usage: AllocUsage,
        min_size: usize,
        completed: u64,
    ) -> Option<DeviceAllocation> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.task_count <= completed && e.memory.usage() == usage && e.memory.len() >= min_size
            })
            .min_by_key(|(_, e)| e.memory.len())
            .map(|(i, _)| i)?;

        self.stats.recycled += 1;
        Some(self.entries.swap_remove(index).memory)
    }

    /// Free completed entries beyond the cache limit, oldest first
    pub fn trim(&mut self, completed: u64) -> usize {
        let ready = self
            .entries
            .iter()
            .filter(|e| e.task_count <= completed)
            .count();
        let mut excess = ready.saturating_sub(self.cache_limit);
        let freed = excess;

        let mut i = 0;
        while excess > 0 && i < self.entries.len() {
            if self.entries[i].task_count <= completed {
                let entry = self.entries.remove(i);
                self.allocator.free(entry.memory);
                excess -= 1;
            } else {
                i += 1;
            }
        }
        self.stats.freed += freed as u64;
        freed
    }

    /// Number of parked allocations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is parked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> ReuseStats {
        self.stats.clone()
    }
}

impl core::fmt::Debug for ReusePool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReusePool")
            .field("entries", &self.entries.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Drop for ReusePool {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            self.allocator.free(entry.memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysmem::HostAllocator;
    use caldera_core::{AllocDesc, ByteSize};

    fn alloc(host: &HostAllocator, usage: AllocUsage, size: u64) -> DeviceAllocation {
        host.allocate(&AllocDesc::new(usage, ByteSize::from_bytes(size)))
            .unwrap()
    }

    #[test]
    fn test_not_recycled_before_completion() {
        let host = Arc::new(HostAllocator::new());
        let mut pool = ReusePool::new(host.clone());

        pool.release(alloc(&host, AllocUsage::LocalStateHeap, 4096), 5);
        assert!(pool.obtain(AllocUsage::LocalStateHeap, 1024, 4).is_none());

        let memory = pool.obtain(AllocUsage::LocalStateHeap, 1024, 5).unwrap();
        assert_eq!(memory.len(), 4096);
        assert!(pool.is_empty());
        host.free(memory);
    }

    #[test]
    fn test_obtain_matches_usage_and_size() {
        let host = Arc::new(HostAllocator::new());
        let mut pool = ReusePool::new(host.clone());

        pool.release(alloc(&host, AllocUsage::SurfaceStateHeap, 8192), 1);
        pool.release(alloc(&host, AllocUsage::LocalStateHeap, 8192), 1);
        pool.release(alloc(&host, AllocUsage::LocalStateHeap, 2048), 1);

        assert!(pool.obtain(AllocUsage::IndirectPayloadHeap, 1, 10).is_none());
        let small = pool.obtain(AllocUsage::LocalStateHeap, 1024, 10).unwrap();
        assert_eq!(small.len(), 2048);
        let large = pool.obtain(AllocUsage::LocalStateHeap, 4096, 10).unwrap();
        assert_eq!(large.len(), 8192);
        assert_eq!(pool.stats().recycled, 2);

        host.free(small);
        host.free(large);
    }

    #[test]
    fn test_trim_and_drop_free_memory() {
        let host = Arc::new(HostAllocator::new());
        let mut pool = ReusePool::with_limit(host.clone(), 1);

        pool.release(alloc(&host, AllocUsage::InstructionBuffer, 4096), 1);
        pool.release(alloc(&host, AllocUsage::InstructionBuffer, 4096), 2);
        pool.release(alloc(&host, AllocUsage::InstructionBuffer, 4096), 9);

        assert_eq!(pool.trim(2), 1);
        assert_eq!(pool.len(), 2);
        assert_eq!(host.live_count(AllocUsage::InstructionBuffer), 2);

        drop(pool);
        assert_eq!(host.live_count(AllocUsage::InstructionBuffer), 0);
    }
}
