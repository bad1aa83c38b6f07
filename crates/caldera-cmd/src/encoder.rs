//! # Dispatch Encoder
//!
//! Turns resolved jobs into instruction records and heap contents.
//!
//! ## Record Order
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ SemaphoreWait × dependencies  │
//! ├───────────────────────────────┤
//! │ StateBaseAddress              │  compute calls only
//! │ DescriptorTableLoad           │
//! ├───────────────────────────────┤
//! │ start captures                │  profiling, perf, packet
//! ├───────────────────────────────┤
//! │ Dispatch / StallBarrier × job │  slot i = compute job i
//! ├───────────────────────────────┤
//! │ StallBarrier + Dispatch       │  device scheduler, last slot
//! ├───────────────────────────────┤
//! │ end captures                  │  packet, perf, profiling
//! └───────────────────────────────┘
//! ```
//!
//! [`DispatchEncoder::size_for`] and [`DispatchEncoder::heap_requirements`]
//! are exact: a call writes precisely the bytes they report.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;

use caldera_core::{AllocDesc, ByteSize, Error, GpuAddr, Invariant, Result, align_up_usize};
use caldera_mem::timestamp::GP_COUNTERS;
use caldera_mem::{
    HeapKind, HeapRequirements, HeapSet, HwPerfCounter, HwTimeStamps, IndirectHeap, ReusePool,
    TagHandle, TagRecord, TimestampPacket,
};

use crate::config::EncoderConfig;
use crate::context::DeviceContext;
use crate::job::Job;
use crate::partition::{self, DeviceLimits, Dim3, WorkGeometry, WorkPartitioner};
use crate::record::{
    BarrierFlags, CompareOp, DescriptorEntry, DescriptorTableLoad, DispatchRecord,
    PostSyncTimestamp, Record, RegisterStore, ReportPerf, SemaphoreWait, StallBarrier,
    StateBaseAddress, SurfaceDescriptor, TimestampKind, registers,
};
use crate::stream::InstructionBuffer;

/// Distinct thread layouts cached per call
const LAYOUT_CACHE: usize = 4;

/// Granularity of live heap allocations
const HEAP_GRANULE: usize = 4096;

bitflags::bitflags! {
    /// Per-call capture features
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DispatchFlags: u32 {
        /// Profiling timestamps around the call
        const PROFILING = 1 << 0;
        /// Performance counter snapshots around the call
        const PERF_COUNTERS = 1 << 1;
        /// Completion packet around the call
        const COMPLETION_PACKET = 1 << 2;
    }
}

/// Options for one dispatch call
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions<'a> {
    /// Capture features
    pub flags: DispatchFlags,
    /// Completion packets to wait on device-side
    pub dependencies: &'a [TagHandle<TimestampPacket>],
}

impl<'a> DispatchOptions<'a> {
    /// Options with `flags` and no dependencies
    pub fn new(flags: DispatchFlags) -> Self {
        Self {
            flags,
            dependencies: &[],
        }
    }

    /// Wait on `dependencies` before the call
    pub fn with_dependencies(mut self, dependencies: &'a [TagHandle<TimestampPacket>]) -> Self {
        self.dependencies = dependencies;
        self
    }
}

// =============================================================================
// CAPTURE TAGS
// =============================================================================

/// Tags consumed by the captures of one call
#[derive(Debug, Default)]
pub struct CaptureTags {
    /// Completion packet
    pub completion: Option<TagHandle<TimestampPacket>>,
    /// Profiling timestamps
    pub profiling: Option<TagHandle<HwTimeStamps>>,
    /// Performance counters
    pub perf: Option<TagHandle<HwPerfCounter>>,
    /// Identifier stamped into both OA reports
    pub report_id: u32,
}

impl CaptureTags {
    fn acquire(ctx: &DeviceContext, flags: DispatchFlags, report_id: u32) -> Result<Self> {
        let mut tags = Self {
            report_id,
            ..Self::default()
        };
        if let Err(e) = tags.fill(ctx, flags) {
            tags.discard();
            return Err(e);
        }
        Ok(tags)
    }

    fn fill(&mut self, ctx: &DeviceContext, flags: DispatchFlags) -> Result<()> {
        if flags.contains(DispatchFlags::PROFILING) {
            self.profiling = Some(ctx.timestamps().get()?);
        }
        if flags.contains(DispatchFlags::PERF_COUNTERS) {
            let perf = ctx.perf_counters().get()?;
            perf.write(HwPerfCounter {
                report_id: self.report_id,
                ..HwPerfCounter::initial()
            });
            self.perf = Some(perf);
        }
        if flags.contains(DispatchFlags::COMPLETION_PACKET) {
            self.completion = Some(ctx.packets().get()?);
        }
        Ok(())
    }

    /// Additional references to the same tags
    pub fn share(&self) -> Self {
        Self {
            completion: self.completion.as_ref().map(TagHandle::share),
            profiling: self.profiling.as_ref().map(TagHandle::share),
            perf: self.perf.as_ref().map(TagHandle::share),
            report_id: self.report_id,
        }
    }

    /// Return tags whose records will never be executed
    pub fn discard(self) {
        if let Some(tag) = self.completion {
            tag.discard();
        }
        if let Some(tag) = self.profiling {
            tag.discard();
        }
        if let Some(tag) = self.perf {
            tag.discard();
        }
    }

    /// Check if no tag is held
    pub fn is_empty(&self) -> bool {
        self.completion.is_none() && self.profiling.is_none() && self.perf.is_none()
    }
}

// =============================================================================
// TARGETS
// =============================================================================

/// The live queue stream and its heaps
#[derive(Debug)]
pub struct LiveTarget<'a> {
    /// Live instruction buffer
    pub stream: &'a mut InstructionBuffer,
    /// Live heaps
    pub heaps: &'a mut HeapSet,
    /// Where exhausted heaps are parked
    pub reuse: &'a mut ReusePool,
    /// Minimum size of a fresh heap
    pub heap_size: ByteSize,
    /// Device's completed task count
    pub completed: u64,
    /// Last task count that may reference the current heaps
    pub retire_at: u64,
}

impl LiveTarget<'_> {
    /// Replace heaps lacking room for `req`; returns how many were retired
    fn grow_heaps(&mut self, ctx: &DeviceContext, req: &HeapRequirements) -> Result<usize> {
        let mut replaced = 0;
        for kind in HeapKind::ALL {
            let need = req.get(kind);
            if need == 0 || self.heaps.available(kind) >= need {
                continue;
            }

            if let Some(old) = self.heaps.take(kind) {
                log::debug!(
                    "{} heap exhausted ({} of {} used), parked until task {}",
                    kind.name(),
                    old.used(),
                    old.capacity(),
                    self.retire_at
                );
                self.reuse.release(old.into_memory(), self.retire_at);
                replaced += 1;
            }

            let size = align_up_usize(need.max(self.heap_size.as_usize()), HEAP_GRANULE);
            let memory = match self.reuse.obtain(kind.usage(), size, self.completed) {
                Some(memory) => memory,
                None => ctx.allocator().allocate(
                    &AllocDesc::new(kind.usage(), ByteSize::from_bytes(size as u64))
                        .with_name(kind.name()),
                )?,
            };
            self.heaps.install(IndirectHeap::new(kind, memory));
        }
        Ok(replaced)
    }
}

/// Where a dispatch call writes
#[derive(Debug)]
pub enum DispatchTarget<'a> {
    /// The queue's live stream; heaps grow on demand
    Live(LiveTarget<'a>),
    /// A bundle's private, exactly sized buffers
    Bundle {
        /// Private instruction buffer
        stream: &'a mut InstructionBuffer,
        /// Private heaps
        heaps: &'a mut HeapSet,
    },
}

impl DispatchTarget<'_> {
    fn prepare_heaps(&mut self, ctx: &DeviceContext, req: &HeapRequirements) -> Result<usize> {
        match self {
            Self::Live(live) => live.grow_heaps(ctx, req),
            Self::Bundle { heaps, .. } => {
                if heaps.fits(req) {
                    Ok(0)
                } else {
                    log::error!("bundle heaps smaller than sized requirement {:?}", req);
                    Err(Invariant::HeapOverflow.into())
                }
            }
        }
    }

    fn parts(&mut self) -> (&mut InstructionBuffer, &mut HeapSet) {
        match self {
            Self::Live(live) => (&mut *live.stream, &mut *live.heaps),
            Self::Bundle { stream, heaps } => (&mut **stream, &mut **heaps),
        }
    }
}

// =============================================================================
// JOBS & OUTCOME
// =============================================================================

/// A job with its geometry; markers have none
#[derive(Debug, Clone, Copy)]
pub struct ResolvedJob<'a> {
    /// The job
    pub job: &'a Job,
    /// Work-group geometry, for compute jobs
    pub geometry: Option<WorkGeometry>,
}

/// Result of one dispatch call
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Geometry per job, in call order
    pub geometries: Vec<Option<WorkGeometry>>,
    /// Tags the call's captures write
    pub captures: CaptureTags,
    /// Instruction bytes written
    pub bytes_written: usize,
    /// Thread layouts computed (not reused)
    pub layouts_computed: usize,
    /// Live heaps retired to make room
    pub heaps_replaced: usize,
}

/// Shape of a call, all that sizing depends on
#[derive(Debug, Clone, Copy)]
struct CallShape {
    compute: usize,
    markers: usize,
    scheduled: bool,
}

impl CallShape {
    fn of(jobs: &[ResolvedJob<'_>]) -> Self {
        let compute = jobs.iter().filter(|r| r.geometry.is_some()).count();
        Self {
            compute,
            markers: jobs.len() - compute,
            scheduled: jobs.iter().any(|r| r.job.device_scheduled),
        }
    }

    fn has_table(&self) -> bool {
        self.compute > 0 || self.scheduled
    }

    fn table_entries(&self) -> usize {
        self.compute + self.scheduled as usize
    }
}

// =============================================================================
// THREAD LAYOUTS
// =============================================================================

/// Per-thread payload bytes: x, y and z local IDs as u16 per lane
fn per_thread_size(simd: u32) -> usize {
    align_up_usize(3 * simd as usize * 2, 32)
}

#[derive(Debug)]
struct ThreadLayout {
    group_size: Dim3,
    simd: u32,
    data: Vec<u8>,
}

impl ThreadLayout {
    fn build(group_size: Dim3, simd: u32) -> Self {
        let total = group_size.iter().product::<u32>();
        let threads = total.div_ceil(simd) as usize;
        let stride = per_thread_size(simd);
        let lanes = simd as usize;
        let mut data = vec![0u8; threads * stride];

        for linear in 0..total {
            let ids = [
                linear % group_size[0],
                (linear / group_size[0]) % group_size[1],
                linear / (group_size[0] * group_size[1]),
            ];
            let (thread, lane) = (linear as usize / lanes, linear as usize % lanes);
            for (dim, id) in ids.iter().enumerate() {
                let at = thread * stride + (dim * lanes + lane) * 2;
                data[at..at + 2].copy_from_slice(&(*id as u16).to_le_bytes());
            }
        }

        Self {
            group_size,
            simd,
            data,
        }
    }
}

#[derive(Debug, Default)]
struct LayoutCache {
    entries: ArrayVec<ThreadLayout, LAYOUT_CACHE>,
    computed: usize,
}

impl LayoutCache {
    fn get(&mut self, group_size: Dim3, simd: u32) -> &ThreadLayout {
        if let Some(i) = self
            .entries
            .iter()
            .position(|l| l.group_size == group_size && l.simd == simd)
        {
            return &self.entries[i];
        }
        if self.entries.is_full() {
            self.entries.remove(0);
        }
        self.entries.push(ThreadLayout::build(group_size, simd));
        self.computed += 1;
        &self.entries[self.entries.len() - 1]
    }
}

fn heap_mut(heaps: &mut HeapSet, kind: HeapKind) -> Result<&mut IndirectHeap> {
    heaps.get_mut(kind).ok_or_else(|| {
        log::error!("{} heap missing for a sized dispatch", kind.name());
        Error::from(Invariant::HeapOverflow)
    })
}

/// Copy cross-thread and per-thread payload; returns (offset, length)
fn write_payload(heaps: &mut HeapSet, payload: &[u8], per_thread: &[u8]) -> Result<(u32, u32)> {
    let cross = align_up_usize(payload.len(), 32);
    let length = cross + per_thread.len();
    let heap = heap_mut(heaps, HeapKind::IndirectPayload)?;
    let space = heap.allocate(length)?;
    heap.write(space.offset, payload)?;
    heap.write(space.offset + cross, per_thread)?;
    Ok((space.offset as u32, length as u32))
}

// =============================================================================
// ENCODER
// =============================================================================

/// Encodes dispatch calls
#[derive(Debug)]
pub struct DispatchEncoder {
    partitioner: WorkPartitioner,
    config: EncoderConfig,
    next_report_id: AtomicU32,
}

impl DispatchEncoder {
    /// Create an encoder for `limits`
    pub fn new(limits: DeviceLimits, config: EncoderConfig) -> Result<Self> {
        limits.validate()?;
        config.validate()?;
        Ok(Self {
            partitioner: WorkPartitioner::new(limits, config.policy),
            config,
            next_report_id: AtomicU32::new(1),
        })
    }

    /// Get the partitioner
    pub fn partitioner(&self) -> &WorkPartitioner {
        &self.partitioner
    }

    /// Get encoder configuration
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn simd(&self) -> u32 {
        self.partitioner.limits().vector_width
    }

    fn scheduler_threads(&self) -> u32 {
        self.config
            .scheduler_group_size
            .div_ceil(self.config.scheduler_vector_width)
    }

    /// Partition every compute job
    pub fn resolve<'j>(&self, jobs: &'j [Job]) -> Result<Vec<ResolvedJob<'j>>> {
        jobs.iter()
            .map(|job| {
                let geometry = if job.is_compute() {
                    Some(self.partitioner.partition(&job.range)?)
                } else {
                    None
                };
                Ok(ResolvedJob { job, geometry })
            })
            .collect()
    }

    fn perf_begin_size(&self) -> usize {
        let stores = GP_COUNTERS + self.config.perf_user_registers.len();
        StallBarrier::SIZE + ReportPerf::SIZE + stores * RegisterStore::SIZE
    }

    fn perf_end_size(&self) -> usize {
        let stores = GP_COUNTERS + self.config.perf_user_registers.len() + 3;
        StallBarrier::SIZE + stores * RegisterStore::SIZE + ReportPerf::SIZE
    }

    /// Exact instruction bytes [`Self::dispatch`] writes for `jobs`
    pub fn size_for(&self, jobs: &[ResolvedJob<'_>], options: &DispatchOptions<'_>) -> usize {
        let shape = CallShape::of(jobs);
        let mut size = options.dependencies.len() * SemaphoreWait::SIZE;

        if shape.has_table() {
            size += StateBaseAddress::SIZE + DescriptorTableLoad::SIZE;
        }
        if options.flags.contains(DispatchFlags::PROFILING) {
            size += 2 * (RegisterStore::SIZE + PostSyncTimestamp::SIZE);
        }
        if options.flags.contains(DispatchFlags::PERF_COUNTERS) {
            size += self.perf_begin_size() + self.perf_end_size();
        }
        if options.flags.contains(DispatchFlags::COMPLETION_PACKET) {
            size += 4 * PostSyncTimestamp::SIZE;
        }

        size += shape.compute * DispatchRecord::SIZE + shape.markers * StallBarrier::SIZE;
        if shape.scheduled {
            size += StallBarrier::SIZE + DispatchRecord::SIZE;
        }
        size
    }

    /// Exact heap bytes [`Self::dispatch`] consumes for `jobs`
    pub fn heap_requirements(&self, jobs: &[ResolvedJob<'_>]) -> HeapRequirements {
        let shape = CallShape::of(jobs);
        let mut req = HeapRequirements::new();
        if !shape.has_table() {
            return req;
        }

        req.add(
            HeapKind::LocalState,
            shape.table_entries() * DescriptorEntry::SIZE,
        );
        let simd = self.simd();
        for r in jobs {
            let Some(geometry) = &r.geometry else {
                continue;
            };
            req.add(HeapKind::LocalState, r.job.local_state_size as usize);
            req.add(
                HeapKind::SurfaceState,
                r.job.surfaces.len() * SurfaceDescriptor::SIZE,
            );
            let threads = geometry.threads_per_group(simd) as usize;
            req.add(
                HeapKind::IndirectPayload,
                align_up_usize(r.job.payload.len(), 32) + threads * per_thread_size(simd),
            );
        }
        if shape.scheduled {
            let threads = self.scheduler_threads() as usize;
            req.add(
                HeapKind::IndirectPayload,
                threads * per_thread_size(self.config.scheduler_vector_width),
            );
        }
        req
    }

    /// Encode `jobs` into `target`
    ///
    /// Capture tags are taken before anything is written; on error they are
    /// returned and the outcome is discarded.
    pub fn dispatch(
        &self,
        ctx: &DeviceContext,
        jobs: &[ResolvedJob<'_>],
        target: &mut DispatchTarget<'_>,
        options: &DispatchOptions<'_>,
    ) -> Result<DispatchOutcome> {
        if jobs.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let report_id = self.next_report_id.fetch_add(1, Ordering::Relaxed);
        let captures = CaptureTags::acquire(ctx, options.flags, report_id)?;

        match self.encode(ctx, jobs, target, options, &captures) {
            Ok(mut outcome) => {
                outcome.captures = captures;
                Ok(outcome)
            }
            Err(e) => {
                captures.discard();
                Err(e)
            }
        }
    }

    fn encode(
        &self,
        ctx: &DeviceContext,
        jobs: &[ResolvedJob<'_>],
        target: &mut DispatchTarget<'_>,
        options: &DispatchOptions<'_>,
        captures: &CaptureTags,
    ) -> Result<DispatchOutcome> {
        let size = self.size_for(jobs, options);
        let req = self.heap_requirements(jobs);
        let heaps_replaced = target.prepare_heaps(ctx, &req)?;

        let (stream, heaps) = target.parts();
        if stream.available() < size {
            log::error!(
                "instruction buffer holds {} bytes, dispatch needs {}",
                stream.available(),
                size
            );
            return Err(Invariant::StreamOverflow.into());
        }
        log::trace!("dispatch: {} jobs, {} bytes, {:?}", jobs.len(), size, req);

        let start = stream.used();
        let shape = CallShape::of(jobs);
        let mut layouts = LayoutCache::default();

        for dep in options.dependencies {
            stream.emit(&SemaphoreWait::new(
                dep.gpu_addr() + TimestampPacket::CONTEXT_END_OFFSET,
                TimestampPacket::INIT_VALUE,
                CompareOp::NotEqual,
            ))?;
        }

        let (table_offset, entries) = if shape.has_table() {
            self.write_heaps(jobs, &shape, heaps, &mut layouts)?
        } else {
            (0, Vec::new())
        };
        if shape.has_table() {
            let mut bases = [GpuAddr::null(); 3];
            let mut sizes = [0u32; 3];
            for kind in HeapKind::ALL {
                if let Some(heap) = heaps.get(kind) {
                    bases[kind.index()] = heap.gpu_base();
                    sizes[kind.index()] = heap.capacity() as u32;
                }
            }
            stream.emit(&StateBaseAddress::new(bases, sizes))?;
            stream.emit(&DescriptorTableLoad::new(
                table_offset,
                entries.len() as u32,
            ))?;
        }

        self.emit_begin_captures(stream, captures)?;

        let simd = self.simd();
        let mut slot = 0;
        for r in jobs {
            match &r.geometry {
                Some(geometry) => {
                    let entry = &entries[slot];
                    stream.emit(&DispatchRecord {
                        header: DispatchRecord::header(),
                        kernel_lo: entry.kernel_lo,
                        kernel_hi: entry.kernel_hi,
                        descriptor_index: slot as u32,
                        work_dim: geometry.dispatch_dims,
                        global_offset: geometry.offset,
                        group_count: geometry.group_count,
                        group_size: geometry.group_size,
                        simd,
                        threads_per_group: entry.threads_per_group,
                        right_exec_mask: geometry.right_exec_mask(simd),
                        indirect_offset: entry.indirect_offset,
                        indirect_length: entry.indirect_length,
                    })?;
                    slot += 1;
                }
                None => {
                    stream.emit(&StallBarrier::new(BarrierFlags::CS_STALL))?;
                }
            }
        }

        if shape.scheduled {
            let entry = &entries[entries.len() - 1];
            let group = self.config.scheduler_group_size;
            let sched_simd = self.config.scheduler_vector_width;
            stream.emit(&StallBarrier::new(
                BarrierFlags::CS_STALL | BarrierFlags::DC_FLUSH,
            ))?;
            stream.emit(&DispatchRecord {
                header: DispatchRecord::header(),
                kernel_lo: entry.kernel_lo,
                kernel_hi: entry.kernel_hi,
                descriptor_index: (entries.len() - 1) as u32,
                work_dim: 1,
                global_offset: [0; 3],
                group_count: [self.config.scheduler_global_size / group, 1, 1],
                group_size: [group, 1, 1],
                simd: sched_simd,
                threads_per_group: entry.threads_per_group,
                right_exec_mask: partition::right_exec_mask(group, sched_simd),
                indirect_offset: entry.indirect_offset,
                indirect_length: entry.indirect_length,
            })?;
        }

        self.emit_end_captures(stream, captures)?;

        let bytes_written = stream.used() - start;
        debug_assert_eq!(bytes_written, size);

        Ok(DispatchOutcome {
            geometries: jobs.iter().map(|r| r.geometry).collect(),
            captures: CaptureTags::default(),
            bytes_written,
            layouts_computed: layouts.computed,
            heaps_replaced,
        })
    }

    /// Fill heaps and the descriptor table; returns (table offset, entries)
    fn write_heaps(
        &self,
        jobs: &[ResolvedJob<'_>],
        shape: &CallShape,
        heaps: &mut HeapSet,
        layouts: &mut LayoutCache,
    ) -> Result<(u32, Vec<DescriptorEntry>)> {
        let simd = self.simd();
        let table = heap_mut(heaps, HeapKind::LocalState)?
            .allocate(shape.table_entries() * DescriptorEntry::SIZE)?;
        let mut entries = Vec::with_capacity(shape.table_entries());

        for r in jobs {
            let Some(geometry) = &r.geometry else {
                continue;
            };
            let job = r.job;

            let local_state_offset = match job.local_state_size {
                0 => 0,
                size => {
                    heap_mut(heaps, HeapKind::LocalState)?
                        .allocate(size as usize)?
                        .offset
                }
            };

            let surface_state_offset = if job.surfaces.is_empty() {
                0
            } else {
                let heap = heap_mut(heaps, HeapKind::SurfaceState)?;
                let space = heap.allocate(job.surfaces.len() * SurfaceDescriptor::SIZE)?;
                for (i, surface) in job.surfaces.iter().enumerate() {
                    heap.write_pod(
                        space.offset + i * SurfaceDescriptor::SIZE,
                        &SurfaceDescriptor::new(surface),
                    )?;
                }
                space.offset
            };

            let layout = layouts.get(geometry.group_size, simd);
            let (indirect_offset, indirect_length) =
                write_payload(heaps, &job.payload, &layout.data)?;

            let kernel = job.kernel.id();
            entries.push(DescriptorEntry {
                kernel_lo: kernel as u32,
                kernel_hi: (kernel >> 32) as u32,
                indirect_offset,
                indirect_length,
                surface_state_offset: surface_state_offset as u32,
                local_state_offset: local_state_offset as u32,
                threads_per_group: geometry.threads_per_group(simd),
                simd,
            });
        }

        if shape.scheduled {
            let sched_simd = self.config.scheduler_vector_width;
            let layout = layouts.get([self.config.scheduler_group_size, 1, 1], sched_simd);
            let (indirect_offset, indirect_length) = write_payload(heaps, &[], &layout.data)?;

            let kernel = self.config.scheduler_kernel.id();
            entries.push(DescriptorEntry {
                kernel_lo: kernel as u32,
                kernel_hi: (kernel >> 32) as u32,
                indirect_offset,
                indirect_length,
                surface_state_offset: 0,
                local_state_offset: 0,
                threads_per_group: self.scheduler_threads(),
                simd: sched_simd,
            });
        }

        let local = heap_mut(heaps, HeapKind::LocalState)?;
        for (i, entry) in entries.iter().enumerate() {
            local.write_pod(table.offset + i * DescriptorEntry::SIZE, entry)?;
        }
        Ok((table.offset as u32, entries))
    }

    fn emit_begin_captures(
        &self,
        stream: &mut InstructionBuffer,
        captures: &CaptureTags,
    ) -> Result<()> {
        if let Some(ts) = &captures.profiling {
            let base = ts.gpu_addr();
            stream.emit(&RegisterStore::new(
                registers::CONTEXT_TIMESTAMP,
                base + HwTimeStamps::CONTEXT_START_OFFSET,
            ))?;
            stream.emit(&PostSyncTimestamp::new(
                base + HwTimeStamps::GLOBAL_START_OFFSET,
                TimestampKind::Global,
            ))?;
        }

        if let Some(perf) = &captures.perf {
            let base = perf.gpu_addr();
            stream.emit(&StallBarrier::new(BarrierFlags::CS_STALL))?;
            stream.emit(&ReportPerf::new(
                base + HwPerfCounter::REPORT_BEGIN_OFFSET,
                captures.report_id,
            ))?;
            self.emit_counter_stores(
                stream,
                base + HwPerfCounter::GP_BEGIN_OFFSET,
                base + HwPerfCounter::USER_BEGIN_OFFSET,
            )?;
        }

        if let Some(packet) = &captures.completion {
            let base = packet.gpu_addr();
            stream.emit(&PostSyncTimestamp::new(
                base + TimestampPacket::CONTEXT_START_OFFSET,
                TimestampKind::Context,
            ))?;
            stream.emit(&PostSyncTimestamp::new(
                base + TimestampPacket::GLOBAL_START_OFFSET,
                TimestampKind::Global,
            ))?;
        }
        Ok(())
    }

    fn emit_end_captures(&self, stream: &mut InstructionBuffer, captures: &CaptureTags) -> Result<()> {
        if let Some(packet) = &captures.completion {
            let base = packet.gpu_addr();
            stream.emit(&PostSyncTimestamp::new(
                base + TimestampPacket::CONTEXT_END_OFFSET,
                TimestampKind::Context,
            ))?;
            stream.emit(&PostSyncTimestamp::new(
                base + TimestampPacket::GLOBAL_END_OFFSET,
                TimestampKind::Global,
            ))?;
        }

        if let Some(perf) = &captures.perf {
            let base = perf.gpu_addr();
            stream.emit(&StallBarrier::new(BarrierFlags::CS_STALL))?;
            self.emit_counter_stores(
                stream,
                base + HwPerfCounter::GP_END_OFFSET,
                base + HwPerfCounter::USER_END_OFFSET,
            )?;
            for (register, offset) in [
                (registers::OA_STATUS, HwPerfCounter::OA_STATUS_OFFSET),
                (registers::OA_HEAD, HwPerfCounter::OA_HEAD_OFFSET),
                (registers::OA_TAIL, HwPerfCounter::OA_TAIL_OFFSET),
            ] {
                stream.emit(&RegisterStore::new(register, base + offset))?;
            }
            stream.emit(&ReportPerf::new(
                base + HwPerfCounter::REPORT_END_OFFSET,
                captures.report_id,
            ))?;
        }

        if let Some(ts) = &captures.profiling {
            let base = ts.gpu_addr();
            stream.emit(&PostSyncTimestamp::new(
                base + HwTimeStamps::GLOBAL_END_OFFSET,
                TimestampKind::Global,
            ))?;
            stream.emit(&RegisterStore::new(
                registers::CONTEXT_TIMESTAMP,
                base + HwTimeStamps::CONTEXT_END_OFFSET,
            ))?;
        }
        Ok(())
    }

    fn emit_counter_stores(
        &self,
        stream: &mut InstructionBuffer,
        gp: GpuAddr,
        user: GpuAddr,
    ) -> Result<()> {
        for i in 0..GP_COUNTERS as u32 {
            let register = registers::GP_COUNTER_BASE + i * registers::GP_COUNTER_STRIDE;
            stream.emit(&RegisterStore::new(register, gp + i as u64 * 4))?;
        }
        for (i, &register) in self.config.perf_user_registers.iter().enumerate() {
            stream.emit(&RegisterStore::new(register, user + i as u64 * 4))?;
        }
        Ok(())
    }
}

static_assertions::assert_impl_all!(DispatchEncoder: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::partition::NdRange;
    use crate::record::{Decoded, Opcode, RecordIter};
    use alloc::sync::Arc;
    use caldera_core::{
        AllocUsage, DeviceMemoryAllocator, KernelHandle, Surface, SurfaceHandle,
    };
    use caldera_mem::HostAllocator;

    const ALL_FLAGS: DispatchFlags = DispatchFlags::all();

    fn setup(config: EncoderConfig) -> (Arc<HostAllocator>, DeviceContext, DispatchEncoder) {
        let host = Arc::new(HostAllocator::new());
        let ctx = DeviceContext::new(host.clone(), ContextConfig::default()).unwrap();
        let encoder = DispatchEncoder::new(DeviceLimits::default(), config).unwrap();
        (host, ctx, encoder)
    }

    /// Buffers sized exactly like a bundle's
    fn exact_buffers(
        host: &HostAllocator,
        size: usize,
        req: &HeapRequirements,
    ) -> (InstructionBuffer, HeapSet) {
        let memory = host
            .allocate(&AllocDesc::new(
                AllocUsage::InstructionBuffer,
                ByteSize::from_bytes(size as u64),
            ))
            .unwrap();
        let mut heaps = HeapSet::new();
        for kind in HeapKind::ALL {
            if req.get(kind) > 0 {
                let memory = host
                    .allocate(&AllocDesc::new(
                        kind.usage(),
                        ByteSize::from_bytes(req.get(kind) as u64),
                    ))
                    .unwrap();
                heaps.install(IndirectHeap::new(kind, memory));
            }
        }
        (InstructionBuffer::without_reserve(memory), heaps)
    }

    fn kernel(id: u64) -> KernelHandle {
        KernelHandle::new(id)
    }

    fn opcodes(bytes: &[u8]) -> Vec<Opcode> {
        RecordIter::new(bytes).map(|r| r.unwrap().opcode()).collect()
    }

    fn dispatches(bytes: &[u8]) -> Vec<DispatchRecord> {
        RecordIter::new(bytes)
            .filter_map(|r| match r.unwrap() {
                Decoded::Dispatch(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sizing_is_exact() {
        let config = EncoderConfig::default().with_user_register(0x7000).unwrap();
        let (host, ctx, encoder) = setup(config);
        let deps: Vec<_> = (0..2).map(|_| ctx.packets().get().unwrap()).collect();
        let surface = Surface::new(
            SurfaceHandle::new(9),
            GpuAddr::new(0x8000_0000),
            ByteSize::KIB_4,
        );

        let shapes: Vec<Vec<Job>> = vec![
            vec![Job::compute(kernel(1), NdRange::linear(256))],
            vec![Job::marker()],
            vec![
                Job::compute(kernel(1), NdRange::linear(100))
                    .with_payload([1u8; 13])
                    .with_local_state(200)
                    .with_surface(surface),
                Job::marker(),
                Job::compute(kernel(2), NdRange::new(2, [30, 20, 1])),
            ],
            vec![Job::compute(kernel(3), NdRange::linear(64)).scheduled()],
            vec![Job::marker().scheduled()],
        ];

        for jobs in &shapes {
            let resolved = encoder.resolve(jobs).unwrap();
            for bits in 0..=ALL_FLAGS.bits() {
                for dep_count in [0, 2] {
                    let options = DispatchOptions::new(DispatchFlags::from_bits_truncate(bits))
                        .with_dependencies(&deps[..dep_count]);
                    let size = encoder.size_for(&resolved, &options);
                    let req = encoder.heap_requirements(&resolved);
                    let (mut stream, mut heaps) = exact_buffers(&host, size, &req);

                    let outcome = encoder
                        .dispatch(
                            &ctx,
                            &resolved,
                            &mut DispatchTarget::Bundle {
                                stream: &mut stream,
                                heaps: &mut heaps,
                            },
                            &options,
                        )
                        .unwrap();

                    assert_eq!(outcome.bytes_written, size);
                    assert_eq!(stream.available(), 0);
                    for kind in HeapKind::ALL {
                        assert_eq!(heaps.get(kind).map_or(0, |h| h.used()), req.get(kind));
                    }
                    // Every record decodes
                    assert!(RecordIter::new(&stream.read_back().unwrap()).all(|r| r.is_ok()));

                    outcome.captures.discard();
                    host.free(stream.into_allocation());
                    for heap in heaps.drain() {
                        host.free(heap.into_memory());
                    }
                }
            }
        }
    }

    #[test]
    fn test_record_order() {
        let (host, ctx, encoder) = setup(EncoderConfig::default());
        let dep = ctx.packets().get().unwrap();
        let deps = [dep.share()];
        let jobs = [
            Job::compute(kernel(10), NdRange::linear(64)),
            Job::marker(),
            Job::compute(kernel(11), NdRange::linear(128)),
        ];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(DispatchFlags::PROFILING | DispatchFlags::COMPLETION_PACKET)
            .with_dependencies(&deps);
        let (mut stream, mut heaps) = exact_buffers(
            &host,
            encoder.size_for(&resolved, &options),
            &encoder.heap_requirements(&resolved),
        );

        let outcome = encoder
            .dispatch(
                &ctx,
                &resolved,
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &options,
            )
            .unwrap();
        let bytes = stream.read_back().unwrap();

        assert_eq!(
            opcodes(&bytes),
            vec![
                Opcode::SemaphoreWait,
                Opcode::StateBaseAddress,
                Opcode::DescriptorTableLoad,
                Opcode::RegisterStore,
                Opcode::PostSyncTimestamp,
                Opcode::PostSyncTimestamp,
                Opcode::PostSyncTimestamp,
                Opcode::Dispatch,
                Opcode::StallBarrier,
                Opcode::Dispatch,
                Opcode::PostSyncTimestamp,
                Opcode::PostSyncTimestamp,
                Opcode::PostSyncTimestamp,
                Opcode::RegisterStore,
            ]
        );

        let records: Vec<_> = RecordIter::new(&bytes).map(|r| r.unwrap()).collect();
        match records[0] {
            Decoded::SemaphoreWait(wait) => {
                assert_eq!(wait.addr(), dep.gpu_addr() + TimestampPacket::CONTEXT_END_OFFSET);
                assert_eq!(wait.value, TimestampPacket::INIT_VALUE);
                assert_eq!(wait.compare, CompareOp::NotEqual as u32);
            }
            other => panic!("unexpected {:?}", other),
        }
        match records[2] {
            Decoded::DescriptorTableLoad(load) => assert_eq!(load.entry_count, 2),
            other => panic!("unexpected {:?}", other),
        }

        let packet = outcome.captures.completion.as_ref().unwrap().gpu_addr();
        match records[10] {
            Decoded::PostSyncTimestamp(ts) => {
                assert_eq!(ts.addr(), packet + TimestampPacket::CONTEXT_END_OFFSET)
            }
            other => panic!("unexpected {:?}", other),
        }

        let launched = dispatches(&bytes);
        assert_eq!(launched[0].kernel_lo, 10);
        assert_eq!(launched[0].descriptor_index, 0);
        assert_eq!(launched[1].kernel_lo, 11);
        assert_eq!(launched[1].descriptor_index, 1);
        assert_eq!(outcome.geometries[1], None);
    }

    #[test]
    fn test_descriptor_table_and_payload() {
        let (host, ctx, encoder) = setup(EncoderConfig::default());
        let jobs = [Job::compute(
            kernel(0x1_0000_0007),
            NdRange::new(2, [4, 4, 1]).with_required([4, 4, 1]),
        )
            .with_payload([0xAA; 5])];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(DispatchFlags::empty());
        let (mut stream, mut heaps) = exact_buffers(
            &host,
            encoder.size_for(&resolved, &options),
            &encoder.heap_requirements(&resolved),
        );
        encoder
            .dispatch(
                &ctx,
                &resolved,
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &options,
            )
            .unwrap();

        let bytes = stream.read_back().unwrap();
        let load = match RecordIter::new(&bytes).nth(1).unwrap().unwrap() {
            Decoded::DescriptorTableLoad(load) => load,
            other => panic!("unexpected {:?}", other),
        };

        let mut raw = [0u8; DescriptorEntry::SIZE];
        heaps
            .get(HeapKind::LocalState)
            .unwrap()
            .read(load.table_offset as usize, &mut raw)
            .unwrap();
        let entry: DescriptorEntry = bytemuck::pod_read_unaligned(&raw);
        assert_eq!(entry.kernel_lo, 7);
        assert_eq!(entry.kernel_hi, 1);
        assert_eq!(entry.threads_per_group, 1);
        assert_eq!(entry.indirect_length as usize, 32 + per_thread_size(16));

        let payload = heaps.get(HeapKind::IndirectPayload).unwrap();
        let mut cross = [0u8; 5];
        payload.read(entry.indirect_offset as usize, &mut cross).unwrap();
        assert_eq!(cross, [0xAA; 5]);

        // Lane 5 of a 4x4 group is local id (1, 1, 0)
        let per_thread = entry.indirect_offset as usize + 32;
        let mut id = [0u8; 2];
        payload.read(per_thread + 5 * 2, &mut id).unwrap();
        assert_eq!(u16::from_le_bytes(id), 1);
        payload.read(per_thread + (16 + 5) * 2, &mut id).unwrap();
        assert_eq!(u16::from_le_bytes(id), 1);
        payload.read(per_thread + (32 + 5) * 2, &mut id).unwrap();
        assert_eq!(u16::from_le_bytes(id), 0);
    }

    #[test]
    fn test_thread_layout_reused_for_equal_groups() {
        let (host, ctx, encoder) = setup(EncoderConfig::default());
        let jobs = [
            Job::compute(kernel(1), NdRange::linear(256).with_required([256, 1, 1])),
            Job::compute(kernel(2), NdRange::linear(512).with_required([256, 1, 1])),
            Job::compute(kernel(3), NdRange::linear(64).with_required([64, 1, 1])),
            Job::compute(kernel(4), NdRange::linear(1024).with_required([256, 1, 1])),
        ];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(DispatchFlags::empty());
        let (mut stream, mut heaps) = exact_buffers(
            &host,
            encoder.size_for(&resolved, &options),
            &encoder.heap_requirements(&resolved),
        );
        let outcome = encoder
            .dispatch(
                &ctx,
                &resolved,
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &options,
            )
            .unwrap();
        // 256-wide groups for three jobs, 64-wide for one
        assert_eq!(outcome.layouts_computed, 2);
    }

    #[test]
    fn test_scheduler_takes_last_slot() {
        let config = EncoderConfig {
            scheduler_kernel: kernel(0xD00D),
            ..EncoderConfig::default()
        };
        let (host, ctx, encoder) = setup(config);
        let jobs = [Job::compute(kernel(1), NdRange::linear(64)).scheduled()];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(DispatchFlags::empty());
        let (mut stream, mut heaps) = exact_buffers(
            &host,
            encoder.size_for(&resolved, &options),
            &encoder.heap_requirements(&resolved),
        );
        encoder
            .dispatch(
                &ctx,
                &resolved,
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &options,
            )
            .unwrap();

        let bytes = stream.read_back().unwrap();
        assert_eq!(
            opcodes(&bytes),
            vec![
                Opcode::StateBaseAddress,
                Opcode::DescriptorTableLoad,
                Opcode::Dispatch,
                Opcode::StallBarrier,
                Opcode::Dispatch,
            ]
        );
        let launched = dispatches(&bytes);
        assert_eq!(launched[1].kernel_lo, 0xD00D);
        assert_eq!(launched[1].descriptor_index, 1);
        assert_eq!(launched[1].group_size, [128, 1, 1]);
        assert_eq!(launched[1].simd, 8);
        assert_eq!(launched[1].threads_per_group, 16);
        assert_eq!(launched[1].work_dim, 1);
        assert_eq!(launched[1].global_offset, [0; 3]);
    }

    #[test]
    fn test_offset_and_work_dim_encoded() {
        let (host, ctx, encoder) = setup(EncoderConfig::default());
        let range = NdRange::new(3, [64, 1, 1]).with_required([64, 1, 1]);
        let jobs = [
            Job::compute(kernel(1), range),
            Job::compute(kernel(2), range.with_offset([1000, 0, 7])),
        ];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(DispatchFlags::empty());
        let (mut stream, mut heaps) = exact_buffers(
            &host,
            encoder.size_for(&resolved, &options),
            &encoder.heap_requirements(&resolved),
        );
        let outcome = encoder
            .dispatch(
                &ctx,
                &resolved,
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &options,
            )
            .unwrap();
        assert_eq!(outcome.bytes_written, encoder.size_for(&resolved, &options));

        let launched = dispatches(&stream.read_back().unwrap());
        assert_eq!(launched[0].work_dim, 1);
        assert_eq!(launched[0].global_offset, [0, 0, 0]);
        assert_eq!(launched[1].work_dim, 3);
        assert_eq!(launched[1].global_offset, [1000, 0, 7]);
        assert_eq!(launched[0].group_count, launched[1].group_count);
    }

    #[test]
    fn test_perf_blocks() {
        let config = EncoderConfig::default()
            .with_user_register(0x7000)
            .unwrap();
        let (host, ctx, encoder) = setup(config);
        let jobs = [Job::compute(kernel(1), NdRange::linear(16))];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(DispatchFlags::PERF_COUNTERS);
        let (mut stream, mut heaps) = exact_buffers(
            &host,
            encoder.size_for(&resolved, &options),
            &encoder.heap_requirements(&resolved),
        );
        let outcome = encoder
            .dispatch(
                &ctx,
                &resolved,
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &options,
            )
            .unwrap();

        let ops = opcodes(&stream.read_back().unwrap());
        let stores = ops.iter().filter(|&&op| op == Opcode::RegisterStore).count();
        assert_eq!(stores, 2 * (GP_COUNTERS + 1) + 3);
        assert_eq!(ops.iter().filter(|&&op| op == Opcode::ReportPerf).count(), 2);

        let perf = outcome.captures.perf.as_ref().unwrap();
        assert_eq!(perf.read().report_id, outcome.captures.report_id);
    }

    #[test]
    fn test_failure_returns_tags() {
        let (host, ctx, encoder) = setup(EncoderConfig::default());
        let jobs = [Job::compute(kernel(1), NdRange::linear(64))];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(ALL_FLAGS);
        let size = encoder.size_for(&resolved, &options);
        // One byte short
        let (mut stream, mut heaps) =
            exact_buffers(&host, size - 1, &encoder.heap_requirements(&resolved));

        let err = encoder
            .dispatch(
                &ctx,
                &resolved,
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &options,
            )
            .unwrap_err();
        assert_eq!(err, Error::InvariantViolation(Invariant::StreamOverflow));
        assert_eq!(stream.used(), 0);

        for stats in [
            ctx.packets().stats(),
            ctx.timestamps().stats(),
            ctx.perf_counters().stats(),
        ] {
            assert_eq!(stats.in_use, 0);
            assert_eq!(stats.deferred, 0);
        }
    }

    #[test]
    fn test_short_bundle_heap_rejected() {
        let (host, ctx, encoder) = setup(EncoderConfig::default());
        let jobs = [Job::compute(kernel(1), NdRange::linear(64))];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(DispatchFlags::empty());
        let (mut stream, _) = exact_buffers(
            &host,
            encoder.size_for(&resolved, &options),
            &HeapRequirements::new(),
        );
        let mut heaps = HeapSet::new();

        let err = encoder
            .dispatch(
                &ctx,
                &resolved,
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &options,
            )
            .unwrap_err();
        assert_eq!(err, Error::InvariantViolation(Invariant::HeapOverflow));
    }

    #[test]
    fn test_live_heaps_grow_and_retire() {
        let (host, ctx, encoder) = setup(EncoderConfig::default());
        let alloc: Arc<dyn DeviceMemoryAllocator> = host.clone();
        let mut reuse = ReusePool::new(alloc);
        let memory = host
            .allocate(&AllocDesc::new(AllocUsage::InstructionBuffer, ByteSize::KIB_64))
            .unwrap();
        let mut stream = InstructionBuffer::new(memory);
        let mut heaps = HeapSet::new();

        let jobs = [Job::compute(kernel(1), NdRange::linear(64)).with_payload([0u8; 3000])];
        let resolved = encoder.resolve(&jobs).unwrap();
        let options = DispatchOptions::new(DispatchFlags::empty());

        let mut replaced = Vec::new();
        for task in 0..2u64 {
            let mut target = DispatchTarget::Live(LiveTarget {
                stream: &mut stream,
                heaps: &mut heaps,
                reuse: &mut reuse,
                heap_size: ByteSize::KIB_4,
                completed: 0,
                retire_at: task,
            });
            let outcome = encoder.dispatch(&ctx, &resolved, &mut target, &options).unwrap();
            replaced.push(outcome.heaps_replaced);
        }

        // The payload heap only fits one call
        assert_eq!(replaced, vec![0, 1]);
        assert_eq!(reuse.len(), 1);
        assert!(reuse
            .obtain(AllocUsage::IndirectPayloadHeap, 1, 0)
            .is_none());
        let parked = reuse.obtain(AllocUsage::IndirectPayloadHeap, 1, 1).unwrap();
        host.free(parked);
    }

    #[test]
    fn test_empty_call_rejected() {
        let (host, ctx, encoder) = setup(EncoderConfig::default());
        let (mut stream, mut heaps) = exact_buffers(&host, 64, &HeapRequirements::new());
        let err = encoder
            .dispatch(
                &ctx,
                &[],
                &mut DispatchTarget::Bundle {
                    stream: &mut stream,
                    heaps: &mut heaps,
                },
                &DispatchOptions::new(ALL_FLAGS),
            )
            .unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
        assert_eq!(ctx.packets().stats().in_use, 0);
    }
}
