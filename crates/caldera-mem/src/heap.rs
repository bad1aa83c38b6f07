//! # Indirect Heaps
//!
//! Typed linear sub-allocators over device allocations, holding the
//! per-dispatch state that instruction records point into.

use alloc::vec::Vec;

use bytemuck::Pod;

use caldera_core::{AllocUsage, DeviceAllocation, GpuAddr, Invariant, Result, align_up_usize};

/// Alignment of every sub-allocation within a heap
pub const HEAP_ALIGNMENT: usize = 64;

// =============================================================================
// HEAP KINDS
// =============================================================================

/// Heap category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Per-job local/scratch state and descriptor tables
    LocalState,
    /// Surface descriptors and binding tables
    SurfaceState,
    /// Cross-thread and per-thread payload
    IndirectPayload,
}

impl HeapKind {
    /// Number of heap kinds
    pub const COUNT: usize = 3;

    /// All heap kinds, in index order
    pub const ALL: [HeapKind; Self::COUNT] = [
        HeapKind::LocalState,
        HeapKind::SurfaceState,
        HeapKind::IndirectPayload,
    ];

    /// Dense index
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            HeapKind::LocalState => 0,
            HeapKind::SurfaceState => 1,
            HeapKind::IndirectPayload => 2,
        }
    }

    /// Allocation usage for backing memory
    pub const fn usage(self) -> AllocUsage {
        match self {
            HeapKind::LocalState => AllocUsage::LocalStateHeap,
            HeapKind::SurfaceState => AllocUsage::SurfaceStateHeap,
            HeapKind::IndirectPayload => AllocUsage::IndirectPayloadHeap,
        }
    }

    /// Name for logs
    pub const fn name(self) -> &'static str {
        match self {
            HeapKind::LocalState => "local_state",
            HeapKind::SurfaceState => "surface_state",
            HeapKind::IndirectPayload => "indirect_payload",
        }
    }
}

// =============================================================================
// REQUIREMENTS
// =============================================================================

/// Exact heap bytes a dispatch call will consume, per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapRequirements {
    bytes: [usize; HeapKind::COUNT],
}

impl HeapRequirements {
    /// No heap space
    pub const fn new() -> Self {
        Self {
            bytes: [0; HeapKind::COUNT],
        }
    }

    /// Account for one sub-allocation of `size` bytes
    pub fn add(&mut self, kind: HeapKind, size: usize) {
        if size > 0 {
            self.bytes[kind.index()] += align_up_usize(size, HEAP_ALIGNMENT);
        }
    }

    /// Bytes required from `kind`
    #[inline]
    pub fn get(&self, kind: HeapKind) -> usize {
        self.bytes[kind.index()]
    }

    /// Sum over all kinds
    pub fn total(&self) -> usize {
        self.bytes.iter().sum()
    }
}

/// A sub-allocation handed out by a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSpace {
    /// Offset from the heap base
    pub offset: usize,
    /// Device address
    pub gpu_addr: GpuAddr,
}

// =============================================================================
// INDIRECT HEAP
// =============================================================================

/// Linear sub-allocator over one device allocation
#[derive(Debug)]
pub struct IndirectHeap {
    kind: HeapKind,
    memory: DeviceAllocation,
    used: usize,
}

impl IndirectHeap {
    /// Wrap `memory` as an empty heap
    pub fn new(kind: HeapKind, memory: DeviceAllocation) -> Self {
        Self {
            kind,
            memory,
            used: 0,
        }
    }

    /// Get heap kind
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    /// Total bytes
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes handed out
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used)
    }

    /// Device address of the heap base
    pub fn gpu_base(&self) -> GpuAddr {
        self.memory.gpu_addr()
    }

    /// Carve `size` bytes, rounded up to [`HEAP_ALIGNMENT`]
    pub fn allocate(&mut self, size: usize) -> Result<HeapSpace> {
        let offset = align_up_usize(self.used, HEAP_ALIGNMENT);
        let end = offset + align_up_usize(size, HEAP_ALIGNMENT);
        if end > self.capacity() {
            log::error!(
                "{} heap overflow: need {} bytes at {}, capacity {}",
                self.kind.name(),
                size,
                offset,
                self.capacity()
            );
            return Err(Invariant::HeapOverflow.into());
        }
        self.used = end;
        Ok(HeapSpace {
            offset,
            gpu_addr: self.gpu_base() + offset as u64,
        })
    }

    /// Copy bytes to `offset`
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.memory.write_bytes(offset, data)
    }

    /// Copy a POD value to `offset`
    pub fn write_pod<R: Pod>(&mut self, offset: usize, value: &R) -> Result<()> {
        self.memory.write_bytes(offset, bytemuck::bytes_of(value))
    }

    /// Copy bytes out from `offset`
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.memory.read_bytes(offset, out)
    }

    /// Forget all sub-allocations
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Release the backing allocation
    pub fn into_memory(self) -> DeviceAllocation {
        self.memory
    }
}

// =============================================================================
// HEAP SET
// =============================================================================

/// One optional heap per kind
#[derive(Debug)]
pub struct HeapSet {
    heaps: [Option<IndirectHeap>; HeapKind::COUNT],
}

impl HeapSet {
    /// Create an empty set
    pub const fn new() -> Self {
        Self {
            heaps: [None, None, None],
        }
    }

    /// Get heap of `kind`
    pub fn get(&self, kind: HeapKind) -> Option<&IndirectHeap> {
        self.heaps[kind.index()].as_ref()
    }

    /// Get mutable heap of `kind`
    pub fn get_mut(&mut self, kind: HeapKind) -> Option<&mut IndirectHeap> {
        self.heaps[kind.index()].as_mut()
    }

    /// Install a heap, returning the one it replaces
    pub fn install(&mut self, heap: IndirectHeap) -> Option<IndirectHeap> {
        let index = heap.kind().index();
        self.heaps[index].replace(heap)
    }

    /// Remove the heap of `kind`
    pub fn take(&mut self, kind: HeapKind) -> Option<IndirectHeap> {
        self.heaps[kind.index()].take()
    }

    /// Bytes available in the heap of `kind` (zero when absent)
    pub fn available(&self, kind: HeapKind) -> usize {
        self.get(kind).map_or(0, IndirectHeap::available)
    }

    /// Check that every kind can satisfy `req`
    pub fn fits(&self, req: &HeapRequirements) -> bool {
        HeapKind::ALL
            .iter()
            .all(|&kind| req.get(kind) == 0 || self.available(kind) >= req.get(kind))
    }

    /// Remove all heaps
    pub fn drain(&mut self) -> Vec<IndirectHeap> {
        self.heaps.iter_mut().filter_map(Option::take).collect()
    }
}

impl Default for HeapSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysmem::HostAllocator;
    use caldera_core::{AllocDesc, ByteSize, DeviceMemoryAllocator, Error};

    fn heap(host: &HostAllocator, kind: HeapKind, size: u64) -> IndirectHeap {
        let memory = host
            .allocate(&AllocDesc::new(kind.usage(), ByteSize::from_bytes(size)))
            .unwrap();
        IndirectHeap::new(kind, memory)
    }

    #[test]
    fn test_aligned_linear_allocation() {
        let host = HostAllocator::new();
        let mut h = heap(&host, HeapKind::IndirectPayload, 256);

        let a = h.allocate(10).unwrap();
        let b = h.allocate(64).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 64);
        assert_eq!(b.gpu_addr, h.gpu_base() + 64);
        assert_eq!(h.used(), 128);
        assert_eq!(h.available(), 128);

        h.write(b.offset, &[7; 4]).unwrap();
        let mut out = [0u8; 4];
        h.read(b.offset, &mut out).unwrap();
        assert_eq!(out, [7; 4]);

        host.free(h.into_memory());
    }

    #[test]
    fn test_overflow_is_invariant_violation() {
        let host = HostAllocator::new();
        let mut h = heap(&host, HeapKind::LocalState, 128);
        h.allocate(100).unwrap();
        assert_eq!(
            h.allocate(1).unwrap_err(),
            Error::InvariantViolation(Invariant::HeapOverflow)
        );
        h.reset();
        assert!(h.allocate(128).is_ok());
        host.free(h.into_memory());
    }

    #[test]
    fn test_requirements_round_to_alignment() {
        let mut req = HeapRequirements::new();
        req.add(HeapKind::LocalState, 1);
        req.add(HeapKind::LocalState, 64);
        req.add(HeapKind::SurfaceState, 0);
        assert_eq!(req.get(HeapKind::LocalState), 128);
        assert_eq!(req.get(HeapKind::SurfaceState), 0);
        assert_eq!(req.total(), 128);
    }

    #[test]
    fn test_heap_set_fits() {
        let host = HostAllocator::new();
        let mut set = HeapSet::new();
        let mut req = HeapRequirements::new();
        assert!(set.fits(&req));

        req.add(HeapKind::SurfaceState, 100);
        assert!(!set.fits(&req));

        assert!(set.install(heap(&host, HeapKind::SurfaceState, 128)).is_none());
        assert!(set.fits(&req));
        req.add(HeapKind::SurfaceState, 1);
        assert!(!set.fits(&req));

        for h in set.drain() {
            host.free(h.into_memory());
        }
        assert_eq!(host.live_total(), 0);
    }
}
