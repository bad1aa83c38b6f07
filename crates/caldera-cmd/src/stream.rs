//! # Instruction Buffer
//!
//! Append-only record stream over one device allocation.
//!
//! ```text
//! ┌──────────────────────────────────────┬──────────────┬─────────┐
//! │ emitted records                      │    free      │ reserve │
//! └──────────────────────────────────────┴──────────────┴─────────┘
//! 0                                     used        capacity     len
//! ```
//!
//! Buffers that may be chained keep a tail reserve sized for one
//! [`BatchStart`], so a full buffer can always jump to its successor.

use alloc::vec;
use alloc::vec::Vec;

use caldera_core::{DeviceAllocation, GpuAddr, Invariant, Result};

use crate::record::{BatchStart, Record};

/// Bytes kept back for the chaining record
pub const CHAIN_RESERVE: usize = BatchStart::SIZE;

/// Append-only instruction stream
#[derive(Debug)]
pub struct InstructionBuffer {
    memory: DeviceAllocation,
    used: usize,
    reserve: usize,
}

impl InstructionBuffer {
    /// Wrap `memory`, keeping the chaining reserve
    pub fn new(memory: DeviceAllocation) -> Self {
        Self {
            memory,
            used: 0,
            reserve: CHAIN_RESERVE,
        }
    }

    /// Wrap `memory` with no reserve; for buffers that are never chained
    pub fn without_reserve(memory: DeviceAllocation) -> Self {
        Self {
            memory,
            used: 0,
            reserve: 0,
        }
    }

    /// Bytes available to records, excluding the reserve
    pub fn capacity(&self) -> usize {
        self.memory.len().saturating_sub(self.reserve)
    }

    /// Bytes emitted
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available to records
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used)
    }

    /// Device address of the first byte
    pub fn gpu_base(&self) -> GpuAddr {
        self.memory.gpu_addr()
    }

    /// Device address of the next record
    pub fn gpu_cursor(&self) -> GpuAddr {
        self.gpu_base() + self.used as u64
    }

    /// Append one record, returning its offset
    pub fn emit<R: Record>(&mut self, record: &R) -> Result<usize> {
        let offset = self.emit_bytes(bytemuck::bytes_of(record))?;
        #[cfg(feature = "trace-records")]
        log::trace!("record {:?} at {}+{}", R::OPCODE, self.gpu_base(), offset);
        Ok(offset)
    }

    /// Append raw record bytes, returning their offset
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.len() > self.available() {
            log::error!(
                "instruction buffer overflow: {} bytes requested, {} of {} used",
                bytes.len(),
                self.used,
                self.capacity()
            );
            return Err(Invariant::StreamOverflow.into());
        }
        let offset = self.used;
        self.memory.write_bytes(offset, bytes)?;
        self.used += bytes.len();
        Ok(offset)
    }

    /// Close the buffer with a jump to `target`, using the reserve
    pub fn chain_to(&mut self, target: GpuAddr) -> Result<()> {
        let record = BatchStart::new(target);
        if self.used + BatchStart::SIZE > self.memory.len() {
            log::error!("instruction buffer overflow: no room to chain at {}", self.used);
            return Err(Invariant::StreamOverflow.into());
        }
        self.memory.write_bytes(self.used, bytemuck::bytes_of(&record))?;
        self.used += BatchStart::SIZE;
        // Nothing may follow the jump
        self.reserve = self.memory.len();
        Ok(())
    }

    /// Copy the emitted bytes out
    pub fn read_back(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.used];
        self.memory.read_bytes(0, &mut out)?;
        Ok(out)
    }

    /// Forget all records and restore the reserve
    pub fn reset(&mut self) {
        self.used = 0;
        self.reserve = CHAIN_RESERVE;
    }

    /// Release the backing allocation
    pub fn into_allocation(self) -> DeviceAllocation {
        self.memory
    }
}
