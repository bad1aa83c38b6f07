//! # Device Memory Primitives
//!
//! Allocation descriptors, CPU-mapped device allocations and surfaces.

use core::ptr::NonNull;

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::types::*;

// =============================================================================
// ALLOCATION DESCRIPTOR
// =============================================================================

bitflags::bitflags! {
    /// Flags for device memory allocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// CPU accessible (mappable)
        const CPU_VISIBLE = 1 << 0;
        /// Coherent (no explicit flush needed)
        const COHERENT = 1 << 1;
        /// Zero-filled on allocation
        const ZEROED = 1 << 2;
        /// Read by the command processor
        const COMMAND_BUFFER = 1 << 3;
    }
}

/// What an allocation backs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocUsage {
    /// Instruction buffer read by the command processor
    InstructionBuffer,
    /// Per-job local state and descriptor tables
    LocalStateHeap,
    /// Surface descriptors
    SurfaceStateHeap,
    /// Cross-thread and per-thread payload
    IndirectPayloadHeap,
    /// Slab of pooled completion tags
    TagSlab,
    /// Queue completion address
    Completion,
}

/// Device memory allocation descriptor
#[derive(Debug, Clone)]
pub struct AllocDesc {
    /// Size in bytes
    pub size: ByteSize,
    /// Alignment requirement (power of two)
    pub alignment: u64,
    /// Allocation flags
    pub flags: AllocFlags,
    /// What the allocation backs
    pub usage: AllocUsage,
    /// Debug name (for tools)
    pub name: Option<&'static str>,
}

impl AllocDesc {
    /// CPU-visible, coherent allocation for `usage`
    pub const fn new(usage: AllocUsage, size: ByteSize) -> Self {
        Self {
            size,
            alignment: 64,
            flags: AllocFlags::CPU_VISIBLE
                .union(AllocFlags::COHERENT)
                .union(AllocFlags::ZEROED),
            usage,
            name: None,
        }
    }

    /// Override alignment
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Attach a debug name
    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }
}

// =============================================================================
// DEVICE ALLOCATION
// =============================================================================

/// A CPU-mapped, device-visible allocation
///
/// Obtained from a [`crate::DeviceMemoryAllocator`] and handed back to it via
/// `free`. The allocation does not free itself on drop; whoever owns it is
/// responsible for returning it to the allocator it came from.
#[derive(Debug)]
pub struct DeviceAllocation {
    /// Allocator-assigned handle
    handle: AllocationHandle,
    /// Device virtual address
    gpu_addr: GpuAddr,
    /// Size in bytes
    size: ByteSize,
    /// Host mapping
    cpu_ptr: NonNull<u8>,
    /// What the allocation backs
    usage: AllocUsage,
}

impl DeviceAllocation {
    /// Assemble an allocation from allocator-provided parts
    ///
    /// # Safety
    /// - `cpu_ptr` must be valid for reads and writes of `size` bytes for as
    ///   long as the allocation exists
    /// - `gpu_addr` must map the same bytes on the device
    pub unsafe fn from_raw_parts(
        handle: AllocationHandle,
        gpu_addr: GpuAddr,
        size: ByteSize,
        cpu_ptr: NonNull<u8>,
        usage: AllocUsage,
    ) -> Self {
        Self {
            handle,
            gpu_addr,
            size,
            cpu_ptr,
            usage,
        }
    }

    /// Get allocation handle
    #[inline]
    pub fn handle(&self) -> AllocationHandle {
        self.handle
    }

    /// Get device address of the first byte
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Get size
    #[inline]
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Get size as a host length
    #[inline]
    pub fn len(&self) -> usize {
        self.size.as_usize()
    }

    /// Check for a zero-sized allocation
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == ByteSize::ZERO
    }

    /// Get usage
    #[inline]
    pub fn usage(&self) -> AllocUsage {
        self.usage
    }

    /// Check if a device address falls inside this allocation
    #[inline]
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.gpu_addr && (addr - self.gpu_addr) < self.size.as_bytes()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(Error::OutOfBounds),
        }
    }

    /// Copy `data` into the allocation at `offset`
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: range checked above; cpu_ptr valid per constructor contract
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.cpu_ptr.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes at `offset` out of the allocation
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        // SAFETY: range checked above; cpu_ptr valid per constructor contract
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.cpu_ptr.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Volatile read of a POD value that the device may write concurrently
    pub fn read_volatile<T: Pod>(&self, offset: usize) -> Result<T> {
        self.check(offset, core::mem::size_of::<T>())?;
        let mut value = T::zeroed();
        let src = self.cpu_ptr.as_ptr();
        for (i, b) in bytemuck::bytes_of_mut(&mut value).iter_mut().enumerate() {
            // SAFETY: offset + i < offset + size_of::<T>() <= len
            *b = unsafe { src.add(offset + i).read_volatile() };
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
        Ok(value)
    }

    /// Volatile write of a POD value into device-shared memory
    pub fn write_volatile<T: Pod>(&self, offset: usize, value: T) -> Result<()> {
        self.check(offset, core::mem::size_of::<T>())?;
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        let bytes = bytemuck::bytes_of(&value);
        let dst = self.cpu_ptr.as_ptr();
        for (i, b) in bytes.iter().enumerate() {
            // SAFETY: offset + i < offset + size_of::<T>() <= len
            unsafe { dst.add(offset + i).write_volatile(*b) };
        }
        Ok(())
    }
}

// SAFETY: the mapping is plain memory; mutation through `&self` is limited
// to volatile accesses of device-shared records
unsafe impl Send for DeviceAllocation {}
unsafe impl Sync for DeviceAllocation {}

// =============================================================================
// SURFACE
// =============================================================================

/// A device allocation referenced by a job that must be resident at execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Surface {
    /// Surface handle (residency key)
    pub handle: SurfaceHandle,
    /// Device address
    pub gpu_addr: GpuAddr,
    /// Size in bytes
    pub size: ByteSize,
}

impl Surface {
    /// Create a new surface reference
    pub const fn new(handle: SurfaceHandle, gpu_addr: GpuAddr, size: ByteSize) -> Self {
        Self {
            handle,
            gpu_addr,
            size,
        }
    }
}
