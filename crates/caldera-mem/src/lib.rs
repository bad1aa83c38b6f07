//! # CALDERA Memory Management
//!
//! Completion-tag pools, indirect heaps and timeline-safe allocation reuse.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     CALDERA Memory System                       │
//! │                                                                 │
//! │  ┌──────────────────┐  ┌───────────────┐  ┌──────────────────┐  │
//! │  │  Tag Allocator   │  │ Indirect Heap │  │   Reuse Pool     │  │
//! │  │ free / deferred  │  │ local-state,  │  │ (retired heaps & │  │
//! │  │  + slab growth   │  │ surface, IOH  │  │  buffers by task)│  │
//! │  └────────┬─────────┘  └───────┬───────┘  └────────┬─────────┘  │
//! │           │                    │                   │            │
//! │  ┌────────┴────────────────────┴───────────────────┴─────────┐  │
//! │  │                 DeviceMemoryAllocator                     │  │
//! │  │        (HostAllocator for host-backed operation)          │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reclamation Design
//!
//! Nothing the device may still read or write is reused early:
//!
//! - Tags return to a *deferred* list when their release predicate fails and
//!   are swept back to the free list once it passes
//! - Retired heaps and instruction buffers are parked with the task count
//!   that last referenced them and recycled only after the device passes it

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod heap;
pub mod reuse;
pub mod sysmem;
pub mod tag;
pub mod timestamp;

// Re-exports
pub use heap::{HeapKind, HeapRequirements, HeapSet, HeapSpace, IndirectHeap};
pub use reuse::{ReusePool, ReuseStats};
pub use sysmem::{HostAllocator, HostStats};
pub use tag::{TagAllocator, TagHandle, TagPoolConfig, TagPoolStats, TagRecord};
pub use timestamp::{HwPerfCounter, HwTimeStamps, TimestampPacket};
