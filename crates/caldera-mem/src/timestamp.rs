//! # Completion & Profiling Records
//!
//! Fixed-size records the device writes into pooled tags.
//!
//! ```text
//! TimestampPacket   ┌──────────────┬──────────────┬─────────────┬────────────┐
//!  (16 bytes)       │ context_start│ global_start │ context_end │ global_end │
//!                   └──────────────┴──────────────┴─────────────┴────────────┘
//!                     all stamps start at INIT_VALUE; the packet is done once
//!                     both end stamps have been overwritten by the device
//! ```

use core::mem::offset_of;

use bytemuck::{Pod, Zeroable};

use crate::tag::TagRecord;

// =============================================================================
// TIMESTAMP PACKET
// =============================================================================

/// Per-submission completion marker
///
/// Written by the device at start and end of the work it brackets. Other
/// submissions can wait on it device-side by polling `context_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TimestampPacket {
    /// Context-local start stamp
    pub context_start: u32,
    /// Global start stamp
    pub global_start: u32,
    /// Context-local end stamp
    pub context_end: u32,
    /// Global end stamp
    pub global_end: u32,
}

impl TimestampPacket {
    /// Value every stamp holds until the device overwrites it
    pub const INIT_VALUE: u32 = 1;

    /// Byte offset of `context_start`
    pub const CONTEXT_START_OFFSET: u64 = offset_of!(TimestampPacket, context_start) as u64;
    /// Byte offset of `global_start`
    pub const GLOBAL_START_OFFSET: u64 = offset_of!(TimestampPacket, global_start) as u64;
    /// Byte offset of `context_end`
    pub const CONTEXT_END_OFFSET: u64 = offset_of!(TimestampPacket, context_end) as u64;
    /// Byte offset of `global_end`
    pub const GLOBAL_END_OFFSET: u64 = offset_of!(TimestampPacket, global_end) as u64;

    /// Check whether the device has written both end stamps
    #[inline]
    pub const fn is_complete(&self) -> bool {
        self.context_end != Self::INIT_VALUE && self.global_end != Self::INIT_VALUE
    }

    /// Context-local duration, if complete
    pub fn context_duration(&self) -> Option<u32> {
        self.is_complete()
            .then(|| self.context_end.wrapping_sub(self.context_start))
    }
}

impl TagRecord for TimestampPacket {
    const NAME: &'static str = "timestamp_packet";

    fn initial() -> Self {
        Self {
            context_start: Self::INIT_VALUE,
            global_start: Self::INIT_VALUE,
            context_end: Self::INIT_VALUE,
            global_end: Self::INIT_VALUE,
        }
    }

    fn can_be_released(&self) -> bool {
        self.is_complete()
    }

    fn unused() -> Self {
        Self::zeroed()
    }
}

// =============================================================================
// HARDWARE TIMESTAMPS
// =============================================================================

/// Profiling timestamps for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct HwTimeStamps {
    /// Global clock at start
    pub global_start: u64,
    /// Context clock at start
    pub context_start: u64,
    /// Global clock at end
    pub global_end: u64,
    /// Context clock at end
    pub context_end: u64,
}

impl HwTimeStamps {
    /// Byte offset of `global_start`
    pub const GLOBAL_START_OFFSET: u64 = offset_of!(HwTimeStamps, global_start) as u64;
    /// Byte offset of `context_start`
    pub const CONTEXT_START_OFFSET: u64 = offset_of!(HwTimeStamps, context_start) as u64;
    /// Byte offset of `global_end`
    pub const GLOBAL_END_OFFSET: u64 = offset_of!(HwTimeStamps, global_end) as u64;
    /// Byte offset of `context_end`
    pub const CONTEXT_END_OFFSET: u64 = offset_of!(HwTimeStamps, context_end) as u64;
}

impl TagRecord for HwTimeStamps {
    const NAME: &'static str = "hw_timestamps";

    fn initial() -> Self {
        Self::zeroed()
    }

    // Only read after completion is already known through the task count
    fn can_be_released(&self) -> bool {
        true
    }
}

// =============================================================================
// HARDWARE PERFORMANCE COUNTERS
// =============================================================================

/// Number of general-purpose counters captured per snapshot
pub const GP_COUNTERS: usize = 8;
/// Maximum number of user-selected registers captured per snapshot
pub const MAX_USER_REGISTERS: usize = 8;
/// Dwords in one OA report
pub const OA_REPORT_DWORDS: usize = 16;

/// Begin/end performance counter snapshots for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct HwPerfCounter {
    /// Report identifier written with both OA reports
    pub report_id: u32,
    /// Core frequency at capture
    pub core_frequency: u32,
    /// OA unit status at end
    pub oa_status: u32,
    /// OA buffer head at end
    pub oa_head: u32,
    /// OA buffer tail at end
    pub oa_tail: u32,
    /// Reserved
    pub reserved: [u32; 3],
    /// General-purpose counters at start
    pub gp_begin: [u32; GP_COUNTERS],
    /// General-purpose counters at end
    pub gp_end: [u32; GP_COUNTERS],
    /// User registers at start
    pub user_begin: [u32; MAX_USER_REGISTERS],
    /// User registers at end
    pub user_end: [u32; MAX_USER_REGISTERS],
    /// OA report at start
    pub report_begin: [u32; OA_REPORT_DWORDS],
    /// OA report at end
    pub report_end: [u32; OA_REPORT_DWORDS],
}

impl HwPerfCounter {
    /// Byte offset of `oa_status`
    pub const OA_STATUS_OFFSET: u64 = offset_of!(HwPerfCounter, oa_status) as u64;
    /// Byte offset of `oa_head`
    pub const OA_HEAD_OFFSET: u64 = offset_of!(HwPerfCounter, oa_head) as u64;
    /// Byte offset of `oa_tail`
    pub const OA_TAIL_OFFSET: u64 = offset_of!(HwPerfCounter, oa_tail) as u64;
    /// Byte offset of `gp_begin`
    pub const GP_BEGIN_OFFSET: u64 = offset_of!(HwPerfCounter, gp_begin) as u64;
    /// Byte offset of `gp_end`
    pub const GP_END_OFFSET: u64 = offset_of!(HwPerfCounter, gp_end) as u64;
    /// Byte offset of `user_begin`
    pub const USER_BEGIN_OFFSET: u64 = offset_of!(HwPerfCounter, user_begin) as u64;
    /// Byte offset of `user_end`
    pub const USER_END_OFFSET: u64 = offset_of!(HwPerfCounter, user_end) as u64;
    /// Byte offset of `report_begin`
    pub const REPORT_BEGIN_OFFSET: u64 = offset_of!(HwPerfCounter, report_begin) as u64;
    /// Byte offset of `report_end`
    pub const REPORT_END_OFFSET: u64 = offset_of!(HwPerfCounter, report_end) as u64;

    /// Per-counter delta between the snapshots
    pub fn gp_delta(&self) -> [u32; GP_COUNTERS] {
        let mut delta = [0u32; GP_COUNTERS];
        for (i, d) in delta.iter_mut().enumerate() {
            *d = self.gp_end[i].wrapping_sub(self.gp_begin[i]);
        }
        delta
    }
}

impl TagRecord for HwPerfCounter {
    const NAME: &'static str = "hw_perf_counter";

    fn initial() -> Self {
        Self::zeroed()
    }

    fn can_be_released(&self) -> bool {
        true
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<TimestampPacket>(), 16);
static_assertions::const_assert_eq!(core::mem::size_of::<HwTimeStamps>(), 32);
static_assertions::const_assert_eq!(core::mem::size_of::<HwPerfCounter>() % 4, 0);
