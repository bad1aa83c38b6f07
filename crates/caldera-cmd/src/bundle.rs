//! # Submission Bundler
//!
//! Captures a blocked submission into private buffers and flushes it into
//! the live stream once its dependencies resolve.
//!
//! ## Lifecycle
//!
//! ```text
//!              prepare()
//!                  │
//!                  ▼
//!             ┌─────────┐
//!             │ Blocked │
//!             └────┬────┘
//!        submit()  │  submit(aborted)
//!          ┌───────┴────────┐
//!          ▼                ▼
//!    ┌───────────┐    ┌─────────┐
//!    │ Submitted │    │ Aborted │
//!    └───────────┘    └─────────┘
//! ```
//!
//! A bundle owns its instruction buffer, heaps, capture tags and dependency
//! tags. Nothing of it reaches the live stream before `submit`; an aborted
//! bundle leaves no trace there.

use alloc::sync::Arc;
use alloc::vec::Vec;

use caldera_core::{
    AllocDesc, AllocUsage, ByteSize, DeviceMemoryAllocator, Invariant, Result, Surface,
};
use caldera_mem::{HeapKind, HeapSet, IndirectHeap, TagHandle, TimestampPacket};

use crate::config::BundleFlushMode;
use crate::context::DeviceContext;
use crate::encoder::{
    CaptureTags, DispatchEncoder, DispatchFlags, DispatchOptions, DispatchTarget, ResolvedJob,
};
use crate::event::CompletionStamp;
use crate::partition::WorkGeometry;
use crate::queue::LiveStream;
use crate::record::{BatchCall, BatchReturn, PostSyncWrite, Record};
use crate::stream::InstructionBuffer;

/// State of a bundled submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// Waiting for dependencies
    Blocked,
    /// Flushed into the live stream
    Submitted,
    /// Dropped without reaching the device
    Aborted,
}

/// Private snapshot of a blocked submission
pub struct Bundle {
    allocator: Arc<dyn DeviceMemoryAllocator>,
    flush_mode: BundleFlushMode,
    stream: Option<InstructionBuffer>,
    heaps: HeapSet,
    surfaces: Vec<Surface>,
    geometries: Vec<Option<WorkGeometry>>,
    captures: CaptureTags,
    dependencies: Vec<TagHandle<TimestampPacket>>,
    state: BundleState,
}

impl Bundle {
    fn empty(allocator: Arc<dyn DeviceMemoryAllocator>, flush_mode: BundleFlushMode) -> Self {
        Self {
            allocator,
            flush_mode,
            stream: None,
            heaps: HeapSet::new(),
            surfaces: Vec::new(),
            geometries: Vec::new(),
            captures: CaptureTags::default(),
            dependencies: Vec::new(),
            state: BundleState::Blocked,
        }
    }

    /// Current state
    pub fn state(&self) -> BundleState {
        self.state
    }

    /// How the bundle reaches the live stream
    pub fn flush_mode(&self) -> BundleFlushMode {
        self.flush_mode
    }

    /// Surfaces made resident on flush
    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    /// Geometry per job
    pub fn geometries(&self) -> &[Option<WorkGeometry>] {
        &self.geometries
    }

    /// Tags written by the bundle's captures
    pub fn captures(&self) -> &CaptureTags {
        &self.captures
    }

    /// Encoded bytes, zero once flushed or aborted
    pub fn stream_bytes(&self) -> usize {
        self.stream.as_ref().map_or(0, InstructionBuffer::used)
    }

    /// Private instruction buffer, until flushed or aborted
    pub fn stream(&self) -> Option<&InstructionBuffer> {
        self.stream.as_ref()
    }

    /// Private heaps
    pub fn heaps(&self) -> &HeapSet {
        &self.heaps
    }

    fn free_private(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.allocator.free(stream.into_allocation());
        }
        for heap in self.heaps.drain() {
            self.allocator.free(heap.into_memory());
        }
    }

    fn abort(&mut self) {
        self.free_private();
        core::mem::take(&mut self.captures).discard();
        self.dependencies.clear();
        self.state = BundleState::Aborted;
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        if self.state == BundleState::Blocked {
            // Never executed
            core::mem::take(&mut self.captures).discard();
        }
        self.free_private();
    }
}

impl core::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bundle")
            .field("state", &self.state)
            .field("flush_mode", &self.flush_mode)
            .field("stream_bytes", &self.stream_bytes())
            .field("surfaces", &self.surfaces.len())
            .field("dependencies", &self.dependencies.len())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Bundle: Send);

// =============================================================================
// BUNDLER
// =============================================================================

/// Builds and flushes bundles
#[derive(Debug, Clone, Copy)]
pub struct SubmissionBundler {
    flush_mode: BundleFlushMode,
}

impl SubmissionBundler {
    /// Create a bundler producing `flush_mode` bundles
    pub const fn new(flush_mode: BundleFlushMode) -> Self {
        Self { flush_mode }
    }

    /// Get flush mode
    pub fn flush_mode(&self) -> BundleFlushMode {
        self.flush_mode
    }

    /// Encode `jobs` into private, exactly sized buffers
    ///
    /// On failure everything allocated so far is freed and every tag taken is
    /// returned.
    pub fn prepare(
        &self,
        ctx: &DeviceContext,
        encoder: &DispatchEncoder,
        jobs: &[ResolvedJob<'_>],
        flags: DispatchFlags,
        dependencies: Vec<TagHandle<TimestampPacket>>,
    ) -> Result<Bundle> {
        let options = DispatchOptions::new(flags).with_dependencies(&dependencies);
        let mut size = encoder.size_for(jobs, &options);
        if self.flush_mode == BundleFlushMode::Chain {
            size += BatchReturn::SIZE;
        }
        let req = encoder.heap_requirements(jobs);

        let mut bundle = Bundle::empty(ctx.allocator().clone(), self.flush_mode);
        let memory = ctx.allocator().allocate(
            &AllocDesc::new(
                AllocUsage::InstructionBuffer,
                ByteSize::from_bytes(size as u64),
            )
            .with_name("bundle_stream"),
        )?;
        bundle.stream = Some(InstructionBuffer::without_reserve(memory));

        for kind in HeapKind::ALL {
            let need = req.get(kind);
            if need > 0 {
                let memory = ctx.allocator().allocate(
                    &AllocDesc::new(kind.usage(), ByteSize::from_bytes(need as u64))
                        .with_name(kind.name()),
                )?;
                bundle.heaps.install(IndirectHeap::new(kind, memory));
            }
        }

        let Bundle { stream, heaps, .. } = &mut bundle;
        let stream = stream.as_mut().ok_or(Invariant::BundleState)?;
        let outcome = encoder.dispatch(
            ctx,
            jobs,
            &mut DispatchTarget::Bundle { stream, heaps },
            &options,
        )?;
        bundle.captures = outcome.captures;
        bundle.geometries = outcome.geometries;

        if let Some(stream) = bundle.stream.as_mut() {
            if bundle.flush_mode == BundleFlushMode::Chain {
                stream.emit(&BatchReturn::new())?;
            }
        }

        bundle.dependencies = dependencies;
        bundle.surfaces = jobs
            .iter()
            .filter(|r| r.geometry.is_some())
            .flat_map(|r| r.job.surfaces.iter().copied())
            .collect();

        log::debug!(
            "bundle prepared: {} jobs, {} bytes, {} surfaces, {} dependencies",
            jobs.len(),
            size,
            bundle.surfaces.len(),
            bundle.dependencies.len()
        );
        Ok(bundle)
    }

    /// Flush `bundle` into `live`, or drop it when `aborted`
    ///
    /// Returns the completion stamp on success. An aborted bundle advances
    /// nothing and marks nothing resident. A failure leaves the bundle
    /// `Blocked` and the live stream untouched.
    pub fn submit(
        &self,
        live: &mut LiveStream,
        bundle: &mut Bundle,
        aborted: bool,
    ) -> Result<Option<CompletionStamp>> {
        if bundle.state != BundleState::Blocked {
            log::error!("bundle submitted twice (state {:?})", bundle.state);
            return Err(Invariant::BundleState.into());
        }

        if aborted {
            log::warn!(
                "bundle aborted: dependency failed, {} bytes dropped",
                bundle.stream_bytes()
            );
            bundle.abort();
            return Ok(None);
        }

        let Some(stream) = bundle.stream.as_ref() else {
            log::error!("blocked bundle without an instruction buffer");
            return Err(Invariant::BundleState.into());
        };
        let (needed, copied) = match bundle.flush_mode {
            BundleFlushMode::Copy => (stream.used(), Some(stream.read_back()?)),
            BundleFlushMode::Chain => (BatchCall::SIZE, None),
        };
        live.ensure_space(needed + PostSyncWrite::SIZE)?;

        for surface in &bundle.surfaces {
            live.mark_resident(surface.handle);
        }

        match &copied {
            Some(bytes) => live.emit_bytes(bytes)?,
            None => live.emit(&BatchCall::new(stream.gpu_base(), stream.used() as u32))?,
        };
        let stamp = live.finish_task()?;

        // The bundle keeps its buffer until the task is closed
        if let Some(stream) = bundle.stream.take() {
            let memory = stream.into_allocation();
            match copied {
                Some(_) => bundle.allocator.free(memory),
                None => live.park(memory, stamp.0),
            }
        }
        for heap in bundle.heaps.drain() {
            live.park(heap.into_memory(), stamp.0);
        }
        live.retain(
            stamp,
            core::mem::take(&mut bundle.captures),
            core::mem::take(&mut bundle.dependencies),
        );
        bundle.state = BundleState::Submitted;

        log::debug!("bundle flushed as {} ({:?})", stamp, bundle.flush_mode);
        Ok(Some(stamp))
    }
}
