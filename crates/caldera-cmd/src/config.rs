//! # Configuration
//!
//! Encoder, queue and device context settings.

use arrayvec::ArrayVec;

use caldera_core::{ByteSize, Error, KernelHandle, Result};
use caldera_mem::TagPoolConfig;
use caldera_mem::timestamp::MAX_USER_REGISTERS;

use crate::partition::{DeviceLimits, WorkPolicy};

// =============================================================================
// ENCODER
// =============================================================================

/// Dispatch encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Group-size derivation policy
    pub policy: WorkPolicy,
    /// Extra registers captured by performance counter blocks
    pub perf_user_registers: ArrayVec<u32, MAX_USER_REGISTERS>,
    /// Device-resident scheduler kernel
    pub scheduler_kernel: KernelHandle,
    /// Scheduler work-group size
    pub scheduler_group_size: u32,
    /// Scheduler global size
    pub scheduler_global_size: u32,
    /// Scheduler vector width
    pub scheduler_vector_width: u32,
}

impl EncoderConfig {
    /// Add a user register to perf captures
    pub fn with_user_register(mut self, register: u32) -> Result<Self> {
        self.perf_user_registers
            .try_push(register)
            .map_err(|_| Error::InvalidParameter)?;
        Ok(self)
    }

    /// Check scheduler geometry
    pub fn validate(&self) -> Result<()> {
        let group = self.scheduler_group_size;
        if group == 0 || self.scheduler_global_size == 0 || self.scheduler_global_size % group != 0
        {
            return Err(Error::InvalidParameter);
        }
        if !matches!(self.scheduler_vector_width, 8 | 16 | 32) {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            policy: WorkPolicy::default(),
            perf_user_registers: ArrayVec::new(),
            scheduler_kernel: KernelHandle::null(),
            scheduler_group_size: 128,
            scheduler_global_size: 128,
            scheduler_vector_width: 8,
        }
    }
}

// =============================================================================
// QUEUE
// =============================================================================

/// How a flushed bundle reaches the live stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundleFlushMode {
    /// Copy the bundle's records into the live stream
    #[default]
    Copy,
    /// Call the bundle's buffer from the live stream
    Chain,
}

/// Command queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Size of each live instruction buffer
    pub stream_size: ByteSize,
    /// Minimum size of each live heap
    pub heap_size: ByteSize,
    /// Bundle flush mode
    pub flush_mode: BundleFlushMode,
    /// Capture profiling timestamps per submission
    pub profiling: bool,
    /// Capture performance counters per submission
    pub perf_counters: bool,
    /// Bracket every submission with a completion packet
    pub completion_packets: bool,
    /// Completed allocations kept for recycling
    pub reuse_cache: usize,
    /// Queue name for logs
    pub name: &'static str,
    /// Encoder settings
    pub encoder: EncoderConfig,
}

impl QueueConfig {
    /// Queue that also records profiling timestamps
    pub fn profiling() -> Self {
        Self {
            profiling: true,
            name: "profiling_queue",
            ..Self::default()
        }
    }

    /// Queue flushing bundles by call instead of copy
    pub fn chained() -> Self {
        Self {
            flush_mode: BundleFlushMode::Chain,
            name: "chained_queue",
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream_size: ByteSize::KIB_64,
            heap_size: ByteSize::KIB_64,
            flush_mode: BundleFlushMode::Copy,
            profiling: false,
            perf_counters: false,
            completion_packets: true,
            reuse_cache: caldera_mem::reuse::DEFAULT_CACHE_LIMIT,
            name: "compute_queue",
            encoder: EncoderConfig::default(),
        }
    }
}

// =============================================================================
// DEVICE CONTEXT
// =============================================================================

/// Device context configuration
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Work-group limits
    pub limits: DeviceLimits,
    /// Completion packet pool
    pub packets: TagPoolConfig,
    /// Profiling timestamp pool
    pub timestamps: TagPoolConfig,
    /// Performance counter pool
    pub perf_counters: TagPoolConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            limits: DeviceLimits::default(),
            packets: TagPoolConfig::timestamp_packets(),
            timestamps: TagPoolConfig::hw_timestamps(),
            perf_counters: TagPoolConfig::perf_counters(),
        }
    }
}
