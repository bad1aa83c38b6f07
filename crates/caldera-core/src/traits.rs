//! # CALDERA Core Traits
//!
//! Contracts the dispatch core consumes from its environment.
//!
//! ## Trait Hierarchy
//!
//! ```text
//! DeviceMemoryAllocator
//!    │
//!    ├── tag slabs        (caldera-mem::tag)
//!    ├── indirect heaps   (caldera-mem::heap)
//!    └── instruction buffers, bundles (caldera-cmd)
//! ```

use crate::error::Result;
use crate::memory::{AllocDesc, DeviceAllocation, Surface};
use crate::types::*;

// =============================================================================
// DEVICE MEMORY ALLOCATOR TRAIT
// =============================================================================

/// Raw device-memory allocator
///
/// Every device-visible byte the dispatch core touches comes from an
/// implementation of this trait. Failure to allocate is reported as
/// [`crate::Error::OutOfResources`].
pub trait DeviceMemoryAllocator: Send + Sync {
    /// Allocate CPU-mapped device memory
    fn allocate(&self, desc: &AllocDesc) -> Result<DeviceAllocation>;

    /// Return an allocation obtained from [`Self::allocate`]
    fn free(&self, allocation: DeviceAllocation);
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

// Ensure key types are Send + Sync
static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(SurfaceHandle: Send, Sync, Copy, core::hash::Hash);
static_assertions::assert_impl_all!(Surface: Send, Sync, Copy);
static_assertions::assert_impl_all!(DeviceAllocation: Send, Sync);
static_assertions::assert_obj_safe!(DeviceMemoryAllocator);
