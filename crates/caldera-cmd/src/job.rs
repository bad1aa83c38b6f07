//! # Jobs
//!
//! A job is one kernel launch over an iteration space, or a marker that
//! only orders work.

use alloc::vec::Vec;

use caldera_core::{KernelHandle, Surface};

use crate::partition::NdRange;

/// What a job does on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Launch work-groups
    Compute,
    /// Order prior work, no launch
    Marker,
}

/// A unit of submitted work
#[derive(Debug, Clone)]
pub struct Job {
    /// Kernel to launch
    pub kernel: KernelHandle,
    /// Job kind
    pub kind: JobKind,
    /// Iteration space
    pub range: NdRange,
    /// Cross-thread payload, copied into the indirect-payload heap
    pub payload: Vec<u8>,
    /// Local state bytes per dispatch
    pub local_state_size: u32,
    /// Surfaces the kernel touches
    pub surfaces: Vec<Surface>,
    /// Launch the device-resident scheduler after this call
    pub device_scheduled: bool,
}

impl Job {
    /// Compute job launching `kernel` over `range`
    pub fn compute(kernel: KernelHandle, range: NdRange) -> Self {
        Self {
            kernel,
            kind: JobKind::Compute,
            range,
            payload: Vec::new(),
            local_state_size: 0,
            surfaces: Vec::new(),
            device_scheduled: false,
        }
    }

    /// Marker job
    pub fn marker() -> Self {
        Self {
            kernel: KernelHandle::null(),
            kind: JobKind::Marker,
            range: NdRange::linear(1),
            payload: Vec::new(),
            local_state_size: 0,
            surfaces: Vec::new(),
            device_scheduled: false,
        }
    }

    /// Attach a cross-thread payload
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Reserve local state
    pub fn with_local_state(mut self, bytes: u32) -> Self {
        self.local_state_size = bytes;
        self
    }

    /// Reference a surface
    pub fn with_surface(mut self, surface: Surface) -> Self {
        self.surfaces.push(surface);
        self
    }

    /// Request a device-resident scheduler launch
    pub fn scheduled(mut self) -> Self {
        self.device_scheduled = true;
        self
    }

    /// Check for a compute job
    #[inline]
    pub fn is_compute(&self) -> bool {
        self.kind == JobKind::Compute
    }
}
