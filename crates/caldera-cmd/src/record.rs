//! # Instruction Records
//!
//! Fixed-size records consumed by the command processor, and the heap-side
//! structures they point into.
//!
//! Every record starts with a one-dword header:
//!
//! ```text
//!  31            16 15             0
//! ┌────────────────┬────────────────┐
//! │     opcode     │  length (dw)   │
//! └────────────────┴────────────────┘
//! ```
//!
//! Records are plain `repr(C)` dword structs, so the stream is a sequence
//! of `bytemuck` casts and [`RecordIter`] can walk it back.

use core::fmt;
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

use caldera_core::{Error, GpuAddr, Result};

// =============================================================================
// HEADER
// =============================================================================

/// Record opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Program heap base addresses
    StateBaseAddress = 0x01,
    /// Point the dispatcher at a descriptor table
    DescriptorTableLoad = 0x02,
    /// Launch work-groups
    Dispatch = 0x03,
    /// Pipeline stall and cache control
    StallBarrier = 0x04,
    /// Write a timestamp after prior work
    PostSyncTimestamp = 0x05,
    /// Store a register to memory
    RegisterStore = 0x06,
    /// Snapshot the OA unit into memory
    ReportPerf = 0x07,
    /// Poll memory until a condition holds
    SemaphoreWait = 0x08,
    /// Write an immediate after prior work
    PostSyncWrite = 0x09,
    /// Continue execution in another buffer
    BatchStart = 0x0A,
    /// Execute another buffer and come back
    BatchCall = 0x0B,
    /// Return from a called buffer
    BatchReturn = 0x0C,
}

impl Opcode {
    /// Decode a raw opcode
    pub const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x01 => Self::StateBaseAddress,
            0x02 => Self::DescriptorTableLoad,
            0x03 => Self::Dispatch,
            0x04 => Self::StallBarrier,
            0x05 => Self::PostSyncTimestamp,
            0x06 => Self::RegisterStore,
            0x07 => Self::ReportPerf,
            0x08 => Self::SemaphoreWait,
            0x09 => Self::PostSyncWrite,
            0x0A => Self::BatchStart,
            0x0B => Self::BatchCall,
            0x0C => Self::BatchReturn,
            _ => return None,
        })
    }
}

/// Record header dword
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct RecordHeader(pub u32);

impl RecordHeader {
    /// Header for `opcode` spanning `dwords` dwords, header included
    pub const fn new(opcode: Opcode, dwords: u16) -> Self {
        Self(((opcode as u32) << 16) | dwords as u32)
    }

    /// Raw opcode field
    pub const fn raw_opcode(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Decoded opcode
    pub const fn opcode(self) -> Option<Opcode> {
        Opcode::from_raw(self.raw_opcode())
    }

    /// Length in dwords
    pub const fn dwords(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Debug for RecordHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordHeader({:#06x}, {}dw)", self.raw_opcode(), self.dwords())
    }
}

/// A fixed-size instruction record
pub trait Record: Pod {
    /// Record opcode
    const OPCODE: Opcode;

    /// Encoded size in bytes
    const SIZE: usize = size_of::<Self>();

    /// Header every instance carries
    fn header() -> RecordHeader {
        RecordHeader::new(Self::OPCODE, (Self::SIZE / 4) as u16)
    }
}

macro_rules! impl_record {
    ($($ty:ident => $op:ident),* $(,)?) => {
        $(
            impl Record for $ty {
                const OPCODE: Opcode = Opcode::$op;
            }
            static_assertions::const_assert_eq!(size_of::<$ty>() % 4, 0);
        )*
    };
}

bitflags::bitflags! {
    /// Stall barrier behaviour
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BarrierFlags: u32 {
        /// Wait for all prior work to drain
        const CS_STALL = 1 << 0;
        /// Flush the data cache
        const DC_FLUSH = 1 << 1;
        /// Invalidate the texture cache
        const TEXTURE_INVALIDATE = 1 << 2;
        /// Flush the host data cache
        const HDC_FLUSH = 1 << 3;
    }
}

/// Which clock a post-sync timestamp samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimestampKind {
    /// Context-local clock
    Context = 0,
    /// Global clock
    Global = 1,
}

/// Semaphore comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompareOp {
    /// Memory equals the operand
    Equal = 0,
    /// Memory differs from the operand
    NotEqual = 1,
    /// Memory is at least the operand
    GreaterOrEqual = 2,
}

/// Register offsets captured by profiling blocks
pub mod registers {
    /// Context timestamp register
    pub const CONTEXT_TIMESTAMP: u32 = 0x23A8;
    /// First general-purpose counter register
    pub const GP_COUNTER_BASE: u32 = 0x2600;
    /// Stride between general-purpose counter registers
    pub const GP_COUNTER_STRIDE: u32 = 8;
    /// OA unit status
    pub const OA_STATUS: u32 = 0x2B08;
    /// OA buffer head pointer
    pub const OA_HEAD: u32 = 0x2B0C;
    /// OA buffer tail pointer
    pub const OA_TAIL: u32 = 0x2B10;
}

// =============================================================================
// RECORDS
// =============================================================================

/// Heap base addresses for subsequent dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StateBaseAddress {
    /// Header
    pub header: RecordHeader,
    /// Local-state heap base, low dword
    pub local_state_lo: u32,
    /// Local-state heap base, high dword
    pub local_state_hi: u32,
    /// Surface-state heap base, low dword
    pub surface_state_lo: u32,
    /// Surface-state heap base, high dword
    pub surface_state_hi: u32,
    /// Indirect-payload heap base, low dword
    pub indirect_payload_lo: u32,
    /// Indirect-payload heap base, high dword
    pub indirect_payload_hi: u32,
    /// Local-state heap size
    pub local_state_size: u32,
    /// Surface-state heap size
    pub surface_state_size: u32,
    /// Indirect-payload heap size
    pub indirect_payload_size: u32,
}

impl StateBaseAddress {
    /// Point at three heaps of the given bases and sizes
    pub fn new(bases: [GpuAddr; 3], sizes: [u32; 3]) -> Self {
        Self {
            header: Self::header(),
            local_state_lo: bases[0].lo(),
            local_state_hi: bases[0].hi(),
            surface_state_lo: bases[1].lo(),
            surface_state_hi: bases[1].hi(),
            indirect_payload_lo: bases[2].lo(),
            indirect_payload_hi: bases[2].hi(),
            local_state_size: sizes[0],
            surface_state_size: sizes[1],
            indirect_payload_size: sizes[2],
        }
    }
}

/// Descriptor table location inside the local-state heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DescriptorTableLoad {
    /// Header
    pub header: RecordHeader,
    /// Offset from the local-state heap base
    pub table_offset: u32,
    /// Entries in the table
    pub entry_count: u32,
    /// Bytes per entry
    pub entry_size: u32,
}

impl DescriptorTableLoad {
    /// Table of `entry_count` descriptors at `table_offset`
    pub fn new(table_offset: u32, entry_count: u32) -> Self {
        Self {
            header: Self::header(),
            table_offset,
            entry_count,
            entry_size: DescriptorEntry::SIZE as u32,
        }
    }
}

/// Work-group launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DispatchRecord {
    /// Header
    pub header: RecordHeader,
    /// Kernel handle, low dword
    pub kernel_lo: u32,
    /// Kernel handle, high dword
    pub kernel_hi: u32,
    /// Slot in the loaded descriptor table
    pub descriptor_index: u32,
    /// Effective dimensionality of the launch
    pub work_dim: u32,
    /// Global offset per dimension
    pub global_offset: [u32; 3],
    /// Groups per dimension
    pub group_count: [u32; 3],
    /// Work-items per group per dimension
    pub group_size: [u32; 3],
    /// Lanes per hardware thread
    pub simd: u32,
    /// Hardware threads per group
    pub threads_per_group: u32,
    /// Lane mask of the last thread
    pub right_exec_mask: u32,
    /// Indirect payload offset
    pub indirect_offset: u32,
    /// Indirect payload length
    pub indirect_length: u32,
}

/// Pipeline stall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StallBarrier {
    /// Header
    pub header: RecordHeader,
    /// [`BarrierFlags`] bits
    pub flags: u32,
}

impl StallBarrier {
    /// Barrier with `flags`
    pub fn new(flags: BarrierFlags) -> Self {
        Self {
            header: Self::header(),
            flags: flags.bits(),
        }
    }
}

/// Timestamp written once prior work completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PostSyncTimestamp {
    /// Header
    pub header: RecordHeader,
    /// Destination, low dword
    pub addr_lo: u32,
    /// Destination, high dword
    pub addr_hi: u32,
    /// [`TimestampKind`]
    pub kind: u32,
}

impl PostSyncTimestamp {
    /// Sample `kind` into `addr`
    pub fn new(addr: GpuAddr, kind: TimestampKind) -> Self {
        Self {
            header: Self::header(),
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            kind: kind as u32,
        }
    }

    /// Destination address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }
}

/// Register-to-memory store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RegisterStore {
    /// Header
    pub header: RecordHeader,
    /// Register offset
    pub register: u32,
    /// Destination, low dword
    pub addr_lo: u32,
    /// Destination, high dword
    pub addr_hi: u32,
}

impl RegisterStore {
    /// Store `register` to `addr`
    pub fn new(register: u32, addr: GpuAddr) -> Self {
        Self {
            header: Self::header(),
            register,
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
        }
    }

    /// Destination address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }
}

/// OA report snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ReportPerf {
    /// Header
    pub header: RecordHeader,
    /// Destination, low dword
    pub addr_lo: u32,
    /// Destination, high dword
    pub addr_hi: u32,
    /// Identifier stamped into the report
    pub report_id: u32,
}

impl ReportPerf {
    /// Snapshot into `addr` tagged with `report_id`
    pub fn new(addr: GpuAddr, report_id: u32) -> Self {
        Self {
            header: Self::header(),
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            report_id,
        }
    }
}

/// Wait until a dword in memory satisfies a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SemaphoreWait {
    /// Header
    pub header: RecordHeader,
    /// Polled address, low dword
    pub addr_lo: u32,
    /// Polled address, high dword
    pub addr_hi: u32,
    /// Comparison operand
    pub value: u32,
    /// [`CompareOp`]
    pub compare: u32,
}

impl SemaphoreWait {
    /// Poll `addr` until `compare` against `value` holds
    pub fn new(addr: GpuAddr, value: u32, compare: CompareOp) -> Self {
        Self {
            header: Self::header(),
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            value,
            compare: compare as u32,
        }
    }

    /// Polled address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }
}

/// Immediate written once prior work completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PostSyncWrite {
    /// Header
    pub header: RecordHeader,
    /// Destination, low dword
    pub addr_lo: u32,
    /// Destination, high dword
    pub addr_hi: u32,
    /// Value, low dword
    pub value_lo: u32,
    /// Value, high dword
    pub value_hi: u32,
    /// [`BarrierFlags`] applied before the write
    pub flags: u32,
}

impl PostSyncWrite {
    /// Write `value` to `addr` after a barrier with `flags`
    pub fn new(addr: GpuAddr, value: u64, flags: BarrierFlags) -> Self {
        Self {
            header: Self::header(),
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            value_lo: value as u32,
            value_hi: (value >> 32) as u32,
            flags: flags.bits(),
        }
    }

    /// Destination address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }

    /// Written value
    pub fn value(&self) -> u64 {
        ((self.value_hi as u64) << 32) | self.value_lo as u64
    }
}

/// Jump to another buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BatchStart {
    /// Header
    pub header: RecordHeader,
    /// Target, low dword
    pub addr_lo: u32,
    /// Target, high dword
    pub addr_hi: u32,
}

impl BatchStart {
    /// Continue at `addr`
    pub fn new(addr: GpuAddr) -> Self {
        Self {
            header: Self::header(),
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
        }
    }

    /// Target address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }
}

/// Call into another buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BatchCall {
    /// Header
    pub header: RecordHeader,
    /// Target, low dword
    pub addr_lo: u32,
    /// Target, high dword
    pub addr_hi: u32,
    /// Bytes in the called buffer
    pub length: u32,
}

impl BatchCall {
    /// Execute `length` bytes at `addr`
    pub fn new(addr: GpuAddr, length: u32) -> Self {
        Self {
            header: Self::header(),
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            length,
        }
    }

    /// Target address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }
}

/// Return to the calling buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BatchReturn {
    /// Header
    pub header: RecordHeader,
    /// Reserved
    pub reserved: u32,
}

impl BatchReturn {
    /// Return record
    pub fn new() -> Self {
        Self {
            header: Self::header(),
            reserved: 0,
        }
    }
}

impl Default for BatchReturn {
    fn default() -> Self {
        Self::new()
    }
}

impl_record! {
    StateBaseAddress => StateBaseAddress,
    DescriptorTableLoad => DescriptorTableLoad,
    DispatchRecord => Dispatch,
    StallBarrier => StallBarrier,
    PostSyncTimestamp => PostSyncTimestamp,
    RegisterStore => RegisterStore,
    ReportPerf => ReportPerf,
    SemaphoreWait => SemaphoreWait,
    PostSyncWrite => PostSyncWrite,
    BatchStart => BatchStart,
    BatchCall => BatchCall,
    BatchReturn => BatchReturn,
}

// =============================================================================
// HEAP STRUCTURES
// =============================================================================

/// One descriptor table slot, stored in the local-state heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DescriptorEntry {
    /// Kernel handle, low dword
    pub kernel_lo: u32,
    /// Kernel handle, high dword
    pub kernel_hi: u32,
    /// Indirect payload offset
    pub indirect_offset: u32,
    /// Indirect payload length
    pub indirect_length: u32,
    /// Surface descriptors offset in the surface-state heap
    pub surface_state_offset: u32,
    /// Local state offset in the local-state heap
    pub local_state_offset: u32,
    /// Hardware threads per group
    pub threads_per_group: u32,
    /// Lanes per hardware thread
    pub simd: u32,
}

impl DescriptorEntry {
    /// Encoded size in bytes
    pub const SIZE: usize = size_of::<Self>();
}

/// Surface binding, stored in the surface-state heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SurfaceDescriptor {
    /// Surface handle, low dword
    pub surface_lo: u32,
    /// Surface handle, high dword
    pub surface_hi: u32,
    /// Base address, low dword
    pub addr_lo: u32,
    /// Base address, high dword
    pub addr_hi: u32,
    /// Size, low dword
    pub size_lo: u32,
    /// Size, high dword
    pub size_hi: u32,
    /// Reserved
    pub reserved: [u32; 2],
}

impl SurfaceDescriptor {
    /// Encoded size in bytes
    pub const SIZE: usize = size_of::<Self>();

    /// Describe `surface`
    pub fn new(surface: &caldera_core::Surface) -> Self {
        let id = surface.handle.id();
        let size = surface.size.as_bytes();
        Self {
            surface_lo: id as u32,
            surface_hi: (id >> 32) as u32,
            addr_lo: surface.gpu_addr.lo(),
            addr_hi: surface.gpu_addr.hi(),
            size_lo: size as u32,
            size_hi: (size >> 32) as u32,
            reserved: [0; 2],
        }
    }
}

static_assertions::const_assert_eq!(size_of::<StateBaseAddress>(), 40);
static_assertions::const_assert_eq!(size_of::<DispatchRecord>(), 76);
static_assertions::const_assert_eq!(size_of::<PostSyncWrite>(), 24);
static_assertions::const_assert_eq!(size_of::<BatchStart>(), 12);
static_assertions::const_assert_eq!(size_of::<DescriptorEntry>(), 32);
static_assertions::const_assert_eq!(size_of::<SurfaceDescriptor>(), 32);

// =============================================================================
// DECODER
// =============================================================================

/// A record read back from a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Decoded {
    StateBaseAddress(StateBaseAddress),
    DescriptorTableLoad(DescriptorTableLoad),
    Dispatch(DispatchRecord),
    StallBarrier(StallBarrier),
    PostSyncTimestamp(PostSyncTimestamp),
    RegisterStore(RegisterStore),
    ReportPerf(ReportPerf),
    SemaphoreWait(SemaphoreWait),
    PostSyncWrite(PostSyncWrite),
    BatchStart(BatchStart),
    BatchCall(BatchCall),
    BatchReturn(BatchReturn),
}

impl Decoded {
    /// Opcode of the decoded record
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::StateBaseAddress(_) => Opcode::StateBaseAddress,
            Self::DescriptorTableLoad(_) => Opcode::DescriptorTableLoad,
            Self::Dispatch(_) => Opcode::Dispatch,
            Self::StallBarrier(_) => Opcode::StallBarrier,
            Self::PostSyncTimestamp(_) => Opcode::PostSyncTimestamp,
            Self::RegisterStore(_) => Opcode::RegisterStore,
            Self::ReportPerf(_) => Opcode::ReportPerf,
            Self::SemaphoreWait(_) => Opcode::SemaphoreWait,
            Self::PostSyncWrite(_) => Opcode::PostSyncWrite,
            Self::BatchStart(_) => Opcode::BatchStart,
            Self::BatchCall(_) => Opcode::BatchCall,
            Self::BatchReturn(_) => Opcode::BatchReturn,
        }
    }
}

/// Walks encoded records in a byte slice
///
/// Yields an error and stops at a truncated record or an unknown opcode.
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> RecordIter<'a> {
    /// Iterate records in `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read<R: Record>(&mut self) -> Result<R> {
        let end = self.offset + R::SIZE;
        let chunk = self.bytes.get(self.offset..end).ok_or(Error::OutOfBounds)?;
        self.offset = end;
        Ok(bytemuck::pod_read_unaligned(chunk))
    }

    fn decode(&mut self) -> Result<Decoded> {
        let raw = self
            .bytes
            .get(self.offset..self.offset + 4)
            .ok_or(Error::OutOfBounds)?;
        let header = RecordHeader(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));

        Ok(match header.opcode().ok_or(Error::InvalidParameter)? {
            Opcode::StateBaseAddress => Decoded::StateBaseAddress(self.read()?),
            Opcode::DescriptorTableLoad => Decoded::DescriptorTableLoad(self.read()?),
            Opcode::Dispatch => Decoded::Dispatch(self.read()?),
            Opcode::StallBarrier => Decoded::StallBarrier(self.read()?),
            Opcode::PostSyncTimestamp => Decoded::PostSyncTimestamp(self.read()?),
            Opcode::RegisterStore => Decoded::RegisterStore(self.read()?),
            Opcode::ReportPerf => Decoded::ReportPerf(self.read()?),
            Opcode::SemaphoreWait => Decoded::SemaphoreWait(self.read()?),
            Opcode::PostSyncWrite => Decoded::PostSyncWrite(self.read()?),
            Opcode::BatchStart => Decoded::BatchStart(self.read()?),
            Opcode::BatchCall => Decoded::BatchCall(self.read()?),
            Opcode::BatchReturn => Decoded::BatchReturn(self.read()?),
        })
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<Decoded>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        let item = self.decode();
        if item.is_err() {
            self.offset = self.bytes.len();
        }
        Some(item)
    }
}
