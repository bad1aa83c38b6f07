//! # Command Queue
//!
//! The submission entry point: live stream, pending bundles and completion
//! tracking for one device queue.
//!
//! ## Submission Flow
//!
//! ```text
//!   submit(jobs, deps)
//!        │
//!        ├── failed host dep ─────────────────────────▶ Aborted
//!        │
//!        ├── pending host dep or pending bundles ──▶ Bundle ─▶ Blocked
//!        │                                             │
//!        │                              process_blocked│
//!        ▼                                             ▼
//!   ┌───────────────────────── live stream ──────────────────────────┐
//!   │ task 1 │ task 2 │ bundle (copy / call) │ task 4 │ BatchStart ─▶ │
//!   └────────────────────────────────────────────────────────────────┘
//!        every task ends with PostSyncWrite(completion, task count)
//! ```
//!
//! Submissions reach the live stream in submission order. Once a bundle is
//! pending every later submission is bundled behind it.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::ManuallyDrop;

use hashbrown::HashSet;
use spin::Mutex;

use caldera_core::{
    AllocDesc, AllocUsage, ByteSize, DeviceAllocation, DeviceMemoryAllocator, Error, GpuAddr,
    Result, SurfaceHandle, align_up_usize,
};
use caldera_mem::{HeapSet, ReusePool, ReuseStats, TagHandle, TimestampPacket};

use crate::bundle::{Bundle, SubmissionBundler};
use crate::config::QueueConfig;
use crate::context::DeviceContext;
use crate::encoder::{
    CaptureTags, DispatchEncoder, DispatchFlags, DispatchOptions, DispatchTarget, LiveTarget,
    ResolvedJob,
};
use crate::event::{
    CompletionHandle, CompletionStamp, CompletionStatus, Dependency, EventStatus, SubmitStatus,
    UserEvent,
};
use crate::job::Job;
use crate::record::{BarrierFlags, PostSyncWrite, Record};
use crate::stream::{CHAIN_RESERVE, InstructionBuffer};

/// Granularity of live instruction buffers
const BUFFER_GRANULE: usize = 4096;

/// Bytes of the device-written completion counter
const COMPLETION_SIZE: u64 = 64;

// =============================================================================
// LIVE STREAM
// =============================================================================

/// Tags kept alive until the device passes a task
#[derive(Debug)]
#[allow(dead_code)] // only dropped
struct Retained {
    stamp: CompletionStamp,
    captures: CaptureTags,
    dependencies: Vec<TagHandle<TimestampPacket>>,
}

/// A queue's live instruction stream, heaps and completion counter
///
/// Exactly one writer at a time; [`CommandQueue`] holds it behind its mutex.
pub struct LiveStream {
    allocator: Arc<dyn DeviceMemoryAllocator>,
    stream: ManuallyDrop<InstructionBuffer>,
    stream_size: ByteSize,
    heaps: HeapSet,
    heap_size: ByteSize,
    reuse: ReusePool,
    completion: ManuallyDrop<DeviceAllocation>,
    task_count: u64,
    resident: HashSet<SurfaceHandle>,
    retained: VecDeque<Retained>,
    chained: u64,
}

impl LiveStream {
    /// Allocate the first instruction buffer and the completion counter
    pub fn new(allocator: Arc<dyn DeviceMemoryAllocator>, config: &QueueConfig) -> Result<Self> {
        let completion = allocator.allocate(
            &AllocDesc::new(AllocUsage::Completion, ByteSize::from_bytes(COMPLETION_SIZE))
                .with_name(config.name),
        )?;
        completion.write_volatile(0, 0u64)?;

        let size = align_up_usize(
            config.stream_size.as_usize().max(CHAIN_RESERVE * 2),
            BUFFER_GRANULE,
        );
        let memory = match allocator.allocate(
            &AllocDesc::new(AllocUsage::InstructionBuffer, ByteSize::from_bytes(size as u64))
                .with_name(config.name),
        ) {
            Ok(memory) => memory,
            Err(e) => {
                allocator.free(completion);
                return Err(e);
            }
        };

        Ok(Self {
            reuse: ReusePool::with_limit(allocator.clone(), config.reuse_cache),
            allocator,
            stream: ManuallyDrop::new(InstructionBuffer::new(memory)),
            stream_size: config.stream_size,
            heaps: HeapSet::new(),
            heap_size: config.heap_size,
            completion: ManuallyDrop::new(completion),
            task_count: 0,
            resident: HashSet::new(),
            retained: VecDeque::new(),
            chained: 0,
        })
    }

    /// Tasks written so far
    pub fn task_count(&self) -> u64 {
        self.task_count
    }

    /// Tasks the device reports complete
    pub fn completed(&self) -> u64 {
        self.completion.read_volatile::<u64>(0).unwrap_or(0)
    }

    /// Device address of the completion counter
    pub fn completion_addr(&self) -> GpuAddr {
        self.completion.gpu_addr()
    }

    /// Check if a surface was made resident
    pub fn is_resident(&self, handle: SurfaceHandle) -> bool {
        self.resident.contains(&handle)
    }

    /// Current instruction buffer
    pub fn stream(&self) -> &InstructionBuffer {
        &self.stream
    }

    /// Records in the current instruction buffer
    pub fn read_back(&self) -> Result<Vec<u8>> {
        self.stream.read_back()
    }

    /// Times the stream moved to a fresh buffer
    pub fn chained(&self) -> u64 {
        self.chained
    }

    /// Reuse pool statistics
    pub fn reuse_stats(&self) -> ReuseStats {
        self.reuse.stats()
    }

    /// Make room for `bytes`, chaining to a fresh buffer if needed
    pub(crate) fn ensure_space(&mut self, bytes: usize) -> Result<()> {
        if self.stream.available() >= bytes {
            return Ok(());
        }

        let size = align_up_usize(
            self.stream_size.as_usize().max(bytes + CHAIN_RESERVE),
            BUFFER_GRANULE,
        );
        let completed = self.completed();
        let memory = match self.reuse.obtain(AllocUsage::InstructionBuffer, size, completed) {
            Some(memory) => memory,
            None => self.allocator.allocate(
                &AllocDesc::new(AllocUsage::InstructionBuffer, ByteSize::from_bytes(size as u64))
                    .with_name("live_stream"),
            )?,
        };

        let next = InstructionBuffer::new(memory);
        if let Err(e) = self.stream.chain_to(next.gpu_base()) {
            self.allocator.free(next.into_allocation());
            return Err(e);
        }
        let old = core::mem::replace(&mut *self.stream, next);
        log::debug!(
            "live stream chained: {} bytes in old buffer, new buffer of {} at {}",
            old.used(),
            size,
            self.stream.gpu_base()
        );
        // The jump executes before the next task completes
        self.reuse.release(old.into_allocation(), self.task_count + 1);
        self.chained += 1;
        Ok(())
    }

    pub(crate) fn mark_resident(&mut self, handle: SurfaceHandle) -> bool {
        self.resident.insert(handle)
    }

    pub(crate) fn emit<R: Record>(&mut self, record: &R) -> Result<usize> {
        self.stream.emit(record)
    }

    pub(crate) fn emit_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        self.stream.emit_bytes(bytes)
    }

    /// Close the current task with the task-count write
    pub(crate) fn finish_task(&mut self) -> Result<CompletionStamp> {
        let value = self.task_count + 1;
        self.stream.emit(&PostSyncWrite::new(
            self.completion.gpu_addr(),
            value,
            BarrierFlags::CS_STALL | BarrierFlags::DC_FLUSH,
        ))?;
        self.task_count = value;
        Ok(CompletionStamp(value))
    }

    pub(crate) fn park(&mut self, memory: DeviceAllocation, task_count: u64) {
        self.reuse.release(memory, task_count);
    }

    pub(crate) fn retain(
        &mut self,
        stamp: CompletionStamp,
        captures: CaptureTags,
        dependencies: Vec<TagHandle<TimestampPacket>>,
    ) {
        if captures.is_empty() && dependencies.is_empty() {
            return;
        }
        self.retained.push_back(Retained {
            stamp,
            captures,
            dependencies,
        });
    }

    pub(crate) fn target(&mut self) -> LiveTarget<'_> {
        let completed = self.completed();
        LiveTarget {
            stream: &mut self.stream,
            heaps: &mut self.heaps,
            reuse: &mut self.reuse,
            heap_size: self.heap_size,
            completed,
            retire_at: self.task_count,
        }
    }

    /// Drop retained tags and recycle memory the device is done with
    pub(crate) fn retire(&mut self, ctx: &DeviceContext) -> usize {
        let completed = self.completed();
        let mut retired = 0;
        while let Some(front) = self.retained.front() {
            if !front.stamp.is_reached(completed) {
                break;
            }
            self.retained.pop_front();
            retired += 1;
        }
        let freed = self.reuse.trim(completed);
        let swept = ctx.sweep_tags();
        log::trace!(
            "retired to task {}: {} retained sets, {} allocations freed, {} tags swept",
            completed,
            retired,
            freed,
            swept
        );
        retired
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        // SAFETY: neither field is touched again after being taken here
        let stream = unsafe { ManuallyDrop::take(&mut self.stream) };
        let completion = unsafe { ManuallyDrop::take(&mut self.completion) };
        self.allocator.free(stream.into_allocation());
        self.allocator.free(completion);
        for heap in self.heaps.drain() {
            self.allocator.free(heap.into_memory());
        }
    }
}

impl core::fmt::Debug for LiveStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LiveStream")
            .field("task_count", &self.task_count)
            .field("used", &self.stream.used())
            .field("chained", &self.chained)
            .field("retained", &self.retained.len())
            .field("reuse", &self.reuse)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Submissions written straight into the live stream
    pub live: u64,
    /// Submissions bundled
    pub bundled: u64,
    /// Bundles flushed
    pub flushed: u64,
    /// Submissions aborted, bundled or not
    pub aborted: u64,
    /// Live heaps retired to make room
    pub heaps_replaced: u64,
    /// Thread layouts computed
    pub layouts_computed: u64,
    /// Instruction bytes written by live dispatches
    pub bytes_written: u64,
}

#[derive(Debug)]
struct PendingBundle {
    bundle: Bundle,
    host_deps: Vec<Arc<UserEvent>>,
    handle: CompletionHandle,
}

impl PendingBundle {
    fn failed(&self) -> bool {
        self.host_deps
            .iter()
            .any(|e| e.status() == EventStatus::Failed)
    }

    fn ready(&self) -> bool {
        self.host_deps
            .iter()
            .all(|e| e.status() == EventStatus::Complete)
    }
}

#[derive(Debug)]
struct QueueState {
    live: LiveStream,
    pending: VecDeque<PendingBundle>,
    stats: QueueStats,
}

/// A device queue accepting job submissions
///
/// All mutation happens under one lock, so concurrent submitters are
/// serialized in lock order.
#[derive(Debug)]
pub struct CommandQueue {
    ctx: Arc<DeviceContext>,
    config: QueueConfig,
    encoder: DispatchEncoder,
    bundler: SubmissionBundler,
    state: Mutex<QueueState>,
}

impl CommandQueue {
    /// Create a queue on `ctx`
    pub fn new(ctx: Arc<DeviceContext>, config: QueueConfig) -> Result<Self> {
        let encoder = DispatchEncoder::new(*ctx.limits(), config.encoder.clone())?;
        let live = LiveStream::new(ctx.allocator().clone(), &config)?;

        log::info!(
            "{}: stream {}, heaps {}, {:?} flush",
            config.name,
            config.stream_size,
            config.heap_size,
            config.flush_mode
        );

        Ok(Self {
            bundler: SubmissionBundler::new(config.flush_mode),
            ctx,
            config,
            encoder,
            state: Mutex::new(QueueState {
                live,
                pending: VecDeque::new(),
                stats: QueueStats::default(),
            }),
        })
    }

    /// Get device context
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Get queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Get dispatch encoder
    pub fn encoder(&self) -> &DispatchEncoder {
        &self.encoder
    }

    fn flags(&self) -> DispatchFlags {
        let mut flags = DispatchFlags::empty();
        flags.set(DispatchFlags::PROFILING, self.config.profiling);
        flags.set(DispatchFlags::PERF_COUNTERS, self.config.perf_counters);
        flags.set(
            DispatchFlags::COMPLETION_PACKET,
            self.config.completion_packets,
        );
        flags
    }

    /// Submit `jobs` as one task
    ///
    /// Geometry and resource errors are returned synchronously and leave the
    /// queue as it was. A failed host dependency aborts the submission.
    pub fn submit(
        &self,
        jobs: &[Job],
        dependencies: Vec<Dependency>,
        want_handle: bool,
    ) -> Result<(SubmitStatus, Option<CompletionHandle>)> {
        if jobs.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let resolved = self.encoder.resolve(jobs)?;

        let mut host_deps = Vec::new();
        let mut device_deps = Vec::new();
        for dep in dependencies {
            match dep {
                Dependency::Host(event) => host_deps.push(event),
                Dependency::Device(tag) => device_deps.push(tag),
            }
        }

        let mut state = self.state.lock();
        state.live.retire(&self.ctx);

        if host_deps.iter().any(|e| e.status() == EventStatus::Failed) {
            log::warn!("{}: dependency failed, submission aborted", self.config.name);
            state.stats.aborted += 1;
            let handle = want_handle
                .then(|| CompletionHandle::new(CompletionStatus::Aborted, CaptureTags::default()));
            return Ok((CompletionStatus::Aborted, handle));
        }

        self.flush_ready(&mut state)?;

        let blocked = !state.pending.is_empty()
            || host_deps.iter().any(|e| e.status() == EventStatus::Pending);
        if blocked {
            let bundle =
                self.bundler
                    .prepare(&self.ctx, &self.encoder, &resolved, self.flags(), device_deps)?;
            let handle = CompletionHandle::new(CompletionStatus::Blocked, bundle.captures().share());
            state.pending.push_back(PendingBundle {
                bundle,
                host_deps,
                handle: handle.clone(),
            });
            state.stats.bundled += 1;
            log::debug!(
                "{}: submission bundled, {} pending",
                self.config.name,
                state.pending.len()
            );
            return Ok((CompletionStatus::Blocked, want_handle.then_some(handle)));
        }

        let (stamp, captures) = self.submit_live(&mut state, &resolved, device_deps)?;
        let handle = want_handle.then(|| {
            CompletionHandle::new(CompletionStatus::Submitted(stamp), captures)
        });
        Ok((CompletionStatus::Submitted(stamp), handle))
    }

    fn submit_live(
        &self,
        state: &mut QueueState,
        jobs: &[ResolvedJob<'_>],
        dependencies: Vec<TagHandle<TimestampPacket>>,
    ) -> Result<(CompletionStamp, CaptureTags)> {
        let options = DispatchOptions::new(self.flags()).with_dependencies(&dependencies);
        let live = &mut state.live;
        live.ensure_space(self.encoder.size_for(jobs, &options) + PostSyncWrite::SIZE)?;

        let outcome = self.encoder.dispatch(
            &self.ctx,
            jobs,
            &mut DispatchTarget::Live(live.target()),
            &options,
        )?;
        for r in jobs.iter().filter(|r| r.geometry.is_some()) {
            for surface in &r.job.surfaces {
                live.mark_resident(surface.handle);
            }
        }
        let stamp = live.finish_task()?;

        let shared = outcome.captures.share();
        live.retain(stamp, outcome.captures, dependencies);

        let stats = &mut state.stats;
        stats.live += 1;
        stats.heaps_replaced += outcome.heaps_replaced as u64;
        stats.layouts_computed += outcome.layouts_computed as u64;
        stats.bytes_written += outcome.bytes_written as u64;

        log::trace!("{}: {} written live", self.config.name, stamp);
        Ok((stamp, shared))
    }

    /// Flush pending bundles from the head while their dependencies resolved
    fn flush_ready(&self, state: &mut QueueState) -> Result<usize> {
        let mut processed = 0;
        while let Some(head) = state.pending.front() {
            let aborted = head.failed();
            if !aborted && !head.ready() {
                break;
            }
            let Some(mut pending) = state.pending.pop_front() else {
                break;
            };

            match self
                .bundler
                .submit(&mut state.live, &mut pending.bundle, aborted)
            {
                Ok(Some(stamp)) => {
                    pending.handle.resolve(stamp);
                    state.stats.flushed += 1;
                }
                Ok(None) => {
                    pending.handle.abort();
                    state.stats.aborted += 1;
                }
                Err(e) => {
                    state.pending.push_front(pending);
                    return Err(e);
                }
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Flush or abort pending bundles whose host dependencies resolved
    ///
    /// Stops at the first bundle still waiting; returns how many were
    /// processed.
    pub fn process_blocked(&self) -> Result<usize> {
        let mut state = self.state.lock();
        state.live.retire(&self.ctx);
        self.flush_ready(&mut state)
    }

    /// Tasks the device reports complete
    pub fn completed_task_count(&self) -> u64 {
        self.state.lock().live.completed()
    }

    /// Tasks written to the live stream
    pub fn task_count(&self) -> u64 {
        self.state.lock().live.task_count()
    }

    /// Release what completed tasks held
    pub fn retire(&self) -> usize {
        self.state.lock().live.retire(&self.ctx)
    }

    /// Bundles waiting for dependencies
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats.clone()
    }

    /// Times the live stream moved to a fresh buffer
    pub fn buffers_chained(&self) -> u64 {
        self.state.lock().live.chained()
    }

    /// Device address the completion counter is written to
    pub fn completion_addr(&self) -> GpuAddr {
        self.state.lock().live.completion_addr()
    }

    /// Check if a surface was made resident on this queue
    pub fn is_resident(&self, handle: SurfaceHandle) -> bool {
        self.state.lock().live.is_resident(handle)
    }

    /// Records in the current live instruction buffer
    pub fn live_stream_bytes(&self) -> Result<Vec<u8>> {
        self.state.lock().live.read_back()
    }
}

static_assertions::assert_impl_all!(CommandQueue: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BundleFlushMode, ContextConfig};
    use crate::partition::NdRange;
    use crate::record::{Decoded, Opcode, RecordIter};
    use caldera_core::{KernelHandle, Surface};
    use caldera_mem::HostAllocator;

    fn setup(config: QueueConfig) -> (Arc<HostAllocator>, CommandQueue) {
        let host = Arc::new(HostAllocator::new());
        let ctx = Arc::new(DeviceContext::new(host.clone(), ContextConfig::default()).unwrap());
        let queue = CommandQueue::new(ctx, config).unwrap();
        (host, queue)
    }

    fn job(kernel: u64) -> Job {
        Job::compute(KernelHandle::new(kernel), NdRange::linear(64))
    }

    fn surface(id: u64) -> Surface {
        Surface::new(
            SurfaceHandle::new(id),
            GpuAddr::new(0x9000_0000 + id * 0x1000),
            ByteSize::KIB_4,
        )
    }

    fn records(bytes: &[u8]) -> Vec<Decoded> {
        RecordIter::new(bytes).map(|r| r.unwrap()).collect()
    }

    fn launched_kernels(bytes: &[u8]) -> Vec<u32> {
        records(bytes)
            .into_iter()
            .filter_map(|r| match r {
                Decoded::Dispatch(d) => Some(d.kernel_lo),
                _ => None,
            })
            .collect()
    }

    fn task_writes(bytes: &[u8]) -> Vec<u64> {
        records(bytes)
            .into_iter()
            .filter_map(|r| match r {
                Decoded::PostSyncWrite(w) => Some(w.value()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_live_then_bundled_keeps_submission_order() {
        let (_host, queue) = setup(QueueConfig::default());
        let event = UserEvent::new();

        let (status, _) = queue.submit(&[job(1)], Vec::new(), false).unwrap();
        assert_eq!(status, CompletionStatus::Submitted(CompletionStamp(1)));
        assert_eq!(queue.task_count(), 1);

        let (status, handle) = queue
            .submit(&[job(2)], alloc::vec![Dependency::host(&event)], true)
            .unwrap();
        let handle = handle.unwrap();
        assert_eq!(status, CompletionStatus::Blocked);
        assert_eq!(handle.status(), CompletionStatus::Blocked);
        assert_eq!(queue.task_count(), 1);
        assert_eq!(queue.pending_count(), 1);

        // Nothing flushes while the event is pending
        assert_eq!(queue.process_blocked().unwrap(), 0);

        event.complete();
        assert_eq!(queue.process_blocked().unwrap(), 1);
        assert_eq!(queue.task_count(), 2);
        assert_eq!(handle.stamp(), Some(CompletionStamp(2)));

        let bytes = queue.live_stream_bytes().unwrap();
        assert_eq!(launched_kernels(&bytes), alloc::vec![1, 2]);
        assert_eq!(task_writes(&bytes), alloc::vec![1, 2]);
        assert_eq!(queue.stats().flushed, 1);
    }

    #[test]
    fn test_pending_bundle_forces_bundling() {
        let (_host, queue) = setup(QueueConfig::default());
        let event = UserEvent::new();

        queue
            .submit(&[job(1)], alloc::vec![Dependency::host(&event)], false)
            .unwrap();
        // No dependencies of its own, still queued behind the bundle
        let (status, handle) = queue.submit(&[job(2)], Vec::new(), true).unwrap();
        assert_eq!(status, CompletionStatus::Blocked);
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.task_count(), 0);

        event.complete();
        // Flushed ahead of the next live submission
        let (status, _) = queue.submit(&[job(3)], Vec::new(), false).unwrap();
        assert_eq!(status, CompletionStatus::Submitted(CompletionStamp(3)));
        assert_eq!(handle.unwrap().stamp(), Some(CompletionStamp(2)));

        let bytes = queue.live_stream_bytes().unwrap();
        assert_eq!(launched_kernels(&bytes), alloc::vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_dependency_aborts_without_side_effects() {
        let (host, queue) = setup(QueueConfig::default());
        let event = UserEvent::new();

        let (_, handle) = queue
            .submit(
                &[job(1).with_surface(surface(7))],
                alloc::vec![Dependency::host(&event)],
                true,
            )
            .unwrap();
        let handle = handle.unwrap();
        let allocations = host.live_total();

        event.fail();
        assert_eq!(queue.process_blocked().unwrap(), 1);
        assert_eq!(handle.status(), CompletionStatus::Aborted);
        assert_eq!(queue.task_count(), 0);
        assert!(!queue.is_resident(SurfaceHandle::new(7)));
        assert!(queue.live_stream_bytes().unwrap().is_empty());
        assert!(host.live_total() < allocations);
        assert_eq!(queue.context().packets().stats().in_use, 0);

        // Already failed at submit time
        let (status, handle) = queue
            .submit(&[job(2)], alloc::vec![Dependency::host(&event)], true)
            .unwrap();
        assert_eq!(status, CompletionStatus::Aborted);
        assert_eq!(handle.unwrap().status(), CompletionStatus::Aborted);
        assert_eq!(queue.stats().aborted, 2);
    }

    fn interleaved(flush_first: bool, abort: bool) -> (Vec<Opcode>, u64, bool) {
        let (_host, queue) = setup(QueueConfig::default());
        let event = UserEvent::new();

        queue.submit(&[job(1)], Vec::new(), false).unwrap();
        queue
            .submit(
                &[job(2).with_surface(surface(3))],
                alloc::vec![Dependency::host(&event)],
                false,
            )
            .unwrap();

        let resolve = || {
            if abort {
                event.fail();
            } else {
                event.complete();
            }
        };
        if flush_first {
            resolve();
            queue.process_blocked().unwrap();
            queue.submit(&[job(3)], Vec::new(), false).unwrap();
        } else {
            // Bundled behind the pending one
            queue.submit(&[job(3)], Vec::new(), false).unwrap();
            resolve();
            queue.process_blocked().unwrap();
        }

        let ops = records(&queue.live_stream_bytes().unwrap())
            .iter()
            .map(Decoded::opcode)
            .collect();
        (ops, queue.task_count(), queue.is_resident(SurfaceHandle::new(3)))
    }

    #[test]
    fn test_bundle_atomicity_in_both_interleavings() {
        let (ops_a, count_a, resident_a) = interleaved(true, false);
        let (ops_b, count_b, resident_b) = interleaved(false, false);
        assert_eq!(ops_a, ops_b);
        assert_eq!((count_a, count_b), (3, 3));
        assert!(resident_a && resident_b);

        let (ops_a, count_a, resident_a) = interleaved(true, true);
        let (ops_b, count_b, resident_b) = interleaved(false, true);
        assert_eq!(ops_a, ops_b);
        assert_eq!((count_a, count_b), (2, 2));
        assert!(!resident_a && !resident_b);
    }

    #[test]
    fn test_chained_flush() {
        let (host, queue) = setup(QueueConfig::chained());
        let event = UserEvent::new();
        queue
            .submit(&[job(4)], alloc::vec![Dependency::host(&event)], false)
            .unwrap();
        event.complete();
        queue.process_blocked().unwrap();

        let ops: Vec<_> = records(&queue.live_stream_bytes().unwrap())
            .iter()
            .map(Decoded::opcode)
            .collect();
        assert_eq!(ops, alloc::vec![Opcode::BatchCall, Opcode::PostSyncWrite]);
        assert_eq!(queue.config().flush_mode, BundleFlushMode::Chain);

        // Parked for recycling once the device passes task 1
        let before = host.live_count(AllocUsage::InstructionBuffer);
        host.device_write(queue.completion_addr(), 1u64).unwrap();
        queue.retire();
        assert_eq!(host.live_count(AllocUsage::InstructionBuffer), before);
    }

    #[test]
    fn test_device_dependency_waits_on_packet() {
        let (_host, queue) = setup(QueueConfig::default());
        let (_, first) = queue.submit(&[job(1)], Vec::new(), true).unwrap();
        let tag = first.unwrap().completion_tag().unwrap();

        queue
            .submit(&[job(2)], alloc::vec![Dependency::device(&tag)], false)
            .unwrap();
        let waits: Vec<_> = records(&queue.live_stream_bytes().unwrap())
            .into_iter()
            .filter_map(|r| match r {
                Decoded::SemaphoreWait(w) => Some(w.addr()),
                _ => None,
            })
            .collect();
        assert_eq!(
            waits,
            alloc::vec![tag.gpu_addr() + TimestampPacket::CONTEXT_END_OFFSET]
        );
        // Ours, the first task's retained set and the second's wait
        assert_eq!(tag.refcount(), 3);
    }

    #[test]
    fn test_live_stream_chains_when_full() {
        let config = QueueConfig {
            stream_size: ByteSize::KIB_4,
            ..QueueConfig::default()
        };
        let (_host, queue) = setup(config);
        for i in 0..40 {
            queue.submit(&[job(i)], Vec::new(), false).unwrap();
        }
        assert_eq!(queue.task_count(), 40);
        assert!(queue.buffers_chained() >= 1);

        // The current buffer starts at a task boundary
        let bytes = queue.live_stream_bytes().unwrap();
        let writes = task_writes(&bytes);
        assert_eq!(writes.last(), Some(&40));
        assert!(records(&bytes).iter().all(|r| r.opcode() != Opcode::BatchStart));
    }

    #[test]
    fn test_heap_growth_and_retire() {
        let config = QueueConfig {
            heap_size: ByteSize::KIB_4,
            completion_packets: false,
            ..QueueConfig::default()
        };
        let (host, queue) = setup(config);
        let big = job(1).with_payload(alloc::vec![0u8; 3000]);

        queue.submit(&[big.clone()], Vec::new(), false).unwrap();
        queue.submit(&[big], Vec::new(), false).unwrap();
        assert_eq!(queue.stats().heaps_replaced, 1);

        let parked = host.live_count(AllocUsage::IndirectPayloadHeap);
        assert_eq!(parked, 2);
        host.device_write(queue.completion_addr(), 2u64).unwrap();
        assert_eq!(queue.completed_task_count(), 2);
        queue.retire();
        // Within the cache limit: kept for recycling
        assert_eq!(host.live_count(AllocUsage::IndirectPayloadHeap), 2);
    }

    #[test]
    fn test_retire_releases_completed_packets() {
        let (host, queue) = setup(QueueConfig::default());
        queue.submit(&[job(1)], Vec::new(), false).unwrap();
        assert_eq!(queue.context().packets().stats().in_use, 1);

        // Device finished the task but has not written the packet yet
        host.device_write(queue.completion_addr(), 1u64).unwrap();
        assert_eq!(queue.retire(), 1);
        let stats = queue.context().packets().stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.deferred, 1);
    }

    #[test]
    fn test_submit_recycles_completed_packets() {
        let (host, queue) = setup(QueueConfig::default());
        let before = queue.context().packets().stats();

        for i in 1..=200u64 {
            let (_, handle) = queue.submit(&[job(i)], Vec::new(), true).unwrap();
            let tag = handle.unwrap().completion_tag().unwrap();
            tag.write(TimestampPacket {
                context_end: 7,
                global_end: 7,
                ..tag.read()
            });
            drop(tag);
            host.device_write(queue.completion_addr(), i).unwrap();
        }

        // Only the last task's packet is still held
        let after = queue.context().packets().stats();
        assert_eq!(after.in_use, 1);
        assert_eq!(after.capacity, before.capacity);
        assert_eq!(after.growth_events, before.growth_events);
    }

    #[test]
    fn test_out_of_resources_leaves_queue_untouched() {
        let (host, queue) = setup(QueueConfig::default());
        let in_use = host.stats().bytes_in_use;
        host.set_budget(Some(ByteSize::from_bytes(in_use)));

        let err = queue.submit(&[job(1)], Vec::new(), false).unwrap_err();
        assert_eq!(err, Error::OutOfResources);
        assert_eq!(queue.task_count(), 0);
        assert!(queue.live_stream_bytes().unwrap().is_empty());
        assert_eq!(queue.context().packets().stats().in_use, 0);

        host.set_budget(None);
        let (status, _) = queue.submit(&[job(1)], Vec::new(), false).unwrap();
        assert_eq!(status, CompletionStatus::Submitted(CompletionStamp(1)));
    }

    #[test]
    fn test_invalid_geometry_is_synchronous() {
        let (_host, queue) = setup(QueueConfig::default());
        let bad = Job::compute(
            KernelHandle::new(1),
            NdRange::linear(257).with_required([16, 1, 1]),
        );
        assert!(matches!(
            queue.submit(&[bad], Vec::new(), false),
            Err(Error::InvalidGeometry(_))
        ));
        assert_eq!(
            queue.submit(&[], Vec::new(), false).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(queue.task_count(), 0);
    }

    #[test]
    fn test_concurrent_submitters() {
        let (_host, queue) = setup(QueueConfig::default());
        let queue = Arc::new(queue);

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let (status, _) = queue.submit(&[job(t * 100 + i)], Vec::new(), false).unwrap();
                        assert!(matches!(status, CompletionStatus::Submitted(_)));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(queue.task_count(), 100);
        let writes = task_writes(&queue.live_stream_bytes().unwrap());
        assert_eq!(writes, (1..=100).collect::<Vec<u64>>());
    }
}
