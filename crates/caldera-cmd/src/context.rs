//! # Device Context
//!
//! Per-device state shared by every queue: the memory allocator, the
//! work-group limits and the tag pools.
//!
//! A context is an explicit object. Queues hold it through an `Arc`; there
//! is no process-wide instance.

use alloc::sync::Arc;
use core::fmt;

use caldera_core::{DeviceMemoryAllocator, Result};
use caldera_mem::{HwPerfCounter, HwTimeStamps, TagAllocator, TimestampPacket};

use crate::config::ContextConfig;
use crate::partition::DeviceLimits;

/// Shared per-device state
pub struct DeviceContext {
    allocator: Arc<dyn DeviceMemoryAllocator>,
    limits: DeviceLimits,
    packets: TagAllocator<TimestampPacket>,
    timestamps: TagAllocator<HwTimeStamps>,
    perf_counters: TagAllocator<HwPerfCounter>,
}

impl DeviceContext {
    /// Create a context, preallocating one slab per tag pool
    pub fn new(allocator: Arc<dyn DeviceMemoryAllocator>, config: ContextConfig) -> Result<Self> {
        config.limits.validate()?;

        let packets = TagAllocator::new(allocator.clone(), config.packets)?;
        let timestamps = TagAllocator::new(allocator.clone(), config.timestamps)?;
        let perf_counters = TagAllocator::new(allocator.clone(), config.perf_counters)?;

        log::info!(
            "device context: max group {} ({:?}), simd {}",
            config.limits.max_group_size,
            config.limits.max_group_dims,
            config.limits.vector_width
        );

        Ok(Self {
            allocator,
            limits: config.limits,
            packets,
            timestamps,
            perf_counters,
        })
    }

    /// Get device memory allocator
    pub fn allocator(&self) -> &Arc<dyn DeviceMemoryAllocator> {
        &self.allocator
    }

    /// Get work-group limits
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Get completion packet pool
    pub fn packets(&self) -> &TagAllocator<TimestampPacket> {
        &self.packets
    }

    /// Get profiling timestamp pool
    pub fn timestamps(&self) -> &TagAllocator<HwTimeStamps> {
        &self.timestamps
    }

    /// Get performance counter pool
    pub fn perf_counters(&self) -> &TagAllocator<HwPerfCounter> {
        &self.perf_counters
    }

    /// Sweep every tag pool's deferred list
    pub fn sweep_tags(&self) -> usize {
        self.packets.sweep() + self.timestamps.sweep() + self.perf_counters.sweep()
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("limits", &self.limits)
            .field("packets", &self.packets)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(DeviceContext: Send, Sync);
