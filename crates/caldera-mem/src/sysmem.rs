//! # Host-Backed Device Memory
//!
//! A [`DeviceMemoryAllocator`] that serves device allocations from host
//! memory with synthetic device addresses. Used when no accelerator is
//! attached and as the device double in tests: [`HostAllocator::device_write`]
//! plays the part of the device writing timestamps and task counts.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;

use bytemuck::Pod;
use hashbrown::HashMap;
use spin::Mutex;

use caldera_core::{
    AllocDesc, AllocUsage, AllocationHandle, ByteSize, DeviceAllocation, DeviceMemoryAllocator,
    Error, GpuAddr, Result, align_up,
};

/// First synthetic device address handed out
const VA_BASE: u64 = 0x1_0000_0000;
/// Device page granularity
const VA_PAGE: u64 = 4096;

// =============================================================================
// HOST BLOCK
// =============================================================================

/// A live host allocation
#[derive(Debug)]
struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    gpu_addr: GpuAddr,
    size: u64,
    usage: AllocUsage,
}

impl HostBlock {
    fn contains(&self, addr: GpuAddr, len: u64) -> bool {
        addr >= self.gpu_addr && (addr - self.gpu_addr) + len <= self.size
    }
}

// SAFETY: the block is plain host memory owned by the allocator
unsafe impl Send for HostBlock {}

// =============================================================================
// HOST ALLOCATOR
// =============================================================================

/// Allocator statistics
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    /// Successful allocations
    pub allocations: u64,
    /// Frees
    pub frees: u64,
    /// Allocations refused (budget or host exhaustion)
    pub failures: u64,
    /// Bytes currently allocated
    pub bytes_in_use: u64,
    /// High water mark
    pub peak_bytes: u64,
}

#[derive(Debug)]
struct HostState {
    blocks: HashMap<u64, HostBlock>,
    next_handle: u64,
    next_va: u64,
    budget: Option<u64>,
    stats: HostStats,
}

/// Host-memory implementation of [`DeviceMemoryAllocator`]
#[derive(Debug)]
pub struct HostAllocator {
    state: Mutex<HostState>,
}

impl HostAllocator {
    /// Create an allocator without a byte budget
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                blocks: HashMap::new(),
                next_handle: 1,
                next_va: VA_BASE,
                budget: None,
                stats: HostStats::default(),
            }),
        }
    }

    /// Create an allocator that refuses to exceed `budget` bytes in use
    pub fn with_budget(budget: ByteSize) -> Self {
        let allocator = Self::new();
        allocator.set_budget(Some(budget));
        allocator
    }

    /// Change the byte budget; `None` removes it
    pub fn set_budget(&self, budget: Option<ByteSize>) {
        self.state.lock().budget = budget.map(ByteSize::as_bytes);
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> HostStats {
        self.state.lock().stats.clone()
    }

    /// Number of live allocations with the given usage
    pub fn live_count(&self, usage: AllocUsage) -> usize {
        self.state
            .lock()
            .blocks
            .values()
            .filter(|b| b.usage == usage)
            .count()
    }

    /// Number of live allocations
    pub fn live_total(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Write `value` at a device address, as the device would
    pub fn device_write<T: Pod>(&self, addr: GpuAddr, value: T) -> Result<()> {
        let len = core::mem::size_of::<T>() as u64;
        let state = self.state.lock();
        let block = state
            .blocks
            .values()
            .find(|b| b.contains(addr, len))
            .ok_or(Error::OutOfBounds)?;
        let dst = block.ptr.as_ptr();
        let base = (addr - block.gpu_addr) as usize;
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        for (i, b) in bytemuck::bytes_of(&value).iter().enumerate() {
            // SAFETY: range checked by `contains`; the block stays live under the lock
            unsafe { dst.add(base + i).write_volatile(*b) };
        }
        Ok(())
    }

    /// Read a value at a device address
    pub fn device_read<T: Pod>(&self, addr: GpuAddr) -> Result<T> {
        let len = core::mem::size_of::<T>() as u64;
        let state = self.state.lock();
        let block = state
            .blocks
            .values()
            .find(|b| b.contains(addr, len))
            .ok_or(Error::OutOfBounds)?;
        let src = block.ptr.as_ptr();
        let base = (addr - block.gpu_addr) as usize;
        let mut value = T::zeroed();
        for (i, b) in bytemuck::bytes_of_mut(&mut value).iter_mut().enumerate() {
            // SAFETY: range checked by `contains`; the block stays live under the lock
            *b = unsafe { src.add(base + i).read_volatile() };
        }
        Ok(value)
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemoryAllocator for HostAllocator {
    fn allocate(&self, desc: &AllocDesc) -> Result<DeviceAllocation> {
        let size = desc.size.as_bytes();
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        if !desc.alignment.is_power_of_two() {
            return Err(Error::MisalignedAddress);
        }

        let mut state = self.state.lock();

        if let Some(budget) = state.budget {
            if state.stats.bytes_in_use + size > budget {
                state.stats.failures += 1;
                log::warn!(
                    "host allocator: {:?} request of {} refused (budget {})",
                    desc.usage,
                    desc.size,
                    ByteSize::from_bytes(budget)
                );
                return Err(Error::OutOfResources);
            }
        }

        let layout = Layout::from_size_align(size as usize, desc.alignment.max(8) as usize)
            .map_err(|_| Error::InvalidParameter)?;
        // SAFETY: layout has non-zero size
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| {
            state.stats.failures += 1;
            Error::OutOfResources
        })?;

        let gpu_addr = GpuAddr::new(align_up(state.next_va, desc.alignment.max(VA_PAGE)));
        state.next_va = gpu_addr.raw() + align_up(size, VA_PAGE) + VA_PAGE;

        let id = state.next_handle;
        state.next_handle += 1;
        state.blocks.insert(
            id,
            HostBlock {
                ptr,
                layout,
                gpu_addr,
                size,
                usage: desc.usage,
            },
        );

        state.stats.allocations += 1;
        state.stats.bytes_in_use += size;
        state.stats.peak_bytes = state.stats.peak_bytes.max(state.stats.bytes_in_use);

        log::trace!(
            "host allocator: {:?} {} at {} ({})",
            desc.usage,
            desc.size,
            gpu_addr,
            desc.name.unwrap_or("unnamed")
        );

        // SAFETY: ptr is valid for `size` bytes until freed through this allocator
        Ok(unsafe {
            DeviceAllocation::from_raw_parts(
                AllocationHandle::new(id),
                gpu_addr,
                desc.size,
                ptr,
                desc.usage,
            )
        })
    }

    fn free(&self, allocation: DeviceAllocation) {
        let mut state = self.state.lock();
        match state.blocks.remove(&allocation.handle().id()) {
            Some(block) => {
                state.stats.frees += 1;
                state.stats.bytes_in_use -= block.size;
                // SAFETY: block was allocated with this layout and is no longer tracked
                unsafe { dealloc(block.ptr.as_ptr(), block.layout) };
            }
            None => log::warn!("host allocator: free of unknown {:?}", allocation.handle()),
        }
    }
}

impl Drop for HostAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.blocks.is_empty() {
            log::warn!("host allocator: {} allocations leaked", state.blocks.len());
        }
        for (_, block) in state.blocks.drain() {
            // SAFETY: block was allocated with this layout
            unsafe { dealloc(block.ptr.as_ptr(), block.layout) };
        }
    }
}
