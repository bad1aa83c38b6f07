//! # CALDERA Core
//!
//! Foundational types and contracts for the CALDERA dispatch core.
//!
//! This crate owns the pieces every other layer agrees on: the error
//! taxonomy, strongly typed device addresses and handles, and the
//! [`DeviceMemoryAllocator`] contract through which all device-visible
//! memory is obtained.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      caldera-core                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │     Error           │  │
//! │  │ (Device     │  │ (GpuAddr,   │  │  (InvalidGeometry,  │  │
//! │  │  Allocator) │  │  Handle)    │  │   OutOfResources)   │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │   Memory (AllocDesc, DeviceAllocation, Surface)       │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{Error, GeometryError, Invariant, Result};
pub use memory::{AllocDesc, AllocFlags, AllocUsage, DeviceAllocation, Surface};
pub use traits::DeviceMemoryAllocator;
pub use types::*;
