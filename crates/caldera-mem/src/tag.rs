//! # Completion Tag Pool
//!
//! Pooled, device-visible completion markers with reference counting and
//! deferred reclamation.
//!
//! ```text
//!            get()                         last reference dropped
//!   ┌──────┐ ─────▶ ┌──────────────────┐ ───────────┬──────────────▶ ┌──────┐
//!   │ free │        │ in use (rc >= 1) │            │ predicate ok   │ free │
//!   └──────┘        └──────────────────┘            │                └──────┘
//!       ▲                                           │ predicate fails
//!       │              sweep(): predicate ok   ┌────▼─────┐
//!       └──────────────────────────────────────│ deferred │
//!                                              └──────────┘
//! ```
//!
//! A tag is in exactly one of the three states at any time. Records live in
//! slabs of `batch_count` entries; a slab is only allocated when both the free
//! list and a sweep of the deferred list come up empty.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use bytemuck::Pod;
use spin::Mutex;

use caldera_core::{
    AllocDesc, AllocUsage, ByteSize, DeviceAllocation, DeviceMemoryAllocator, Error, GpuAddr,
    Invariant, Result, align_up_usize,
};

// =============================================================================
// TAG RECORD
// =============================================================================

/// A fixed-size record stored in a pooled tag
pub trait TagRecord: Pod + Send + Sync + 'static {
    /// Pool name for logs
    const NAME: &'static str;

    /// Logical state written every time the tag is handed out
    fn initial() -> Self;

    /// Check whether the device is done with the record
    fn can_be_released(&self) -> bool;

    /// State for a record the device will never execute
    fn unused() -> Self {
        Self::initial()
    }
}

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// Tag pool configuration
#[derive(Debug, Clone)]
pub struct TagPoolConfig {
    /// Records per slab
    pub batch_count: u32,
    /// Alignment of each record within a slab
    pub alignment: u64,
    /// Pool name for debugging
    pub name: &'static str,
}

impl TagPoolConfig {
    /// Config with `batch_count` records per slab
    pub const fn new(batch_count: u32) -> Self {
        Self {
            batch_count,
            alignment: 64,
            name: "tag_pool",
        }
    }

    /// Config for per-submission completion packets
    pub const fn timestamp_packets() -> Self {
        Self {
            batch_count: 64,
            alignment: 64,
            name: "timestamp_packets",
        }
    }

    /// Config for profiling timestamps
    pub const fn hw_timestamps() -> Self {
        Self {
            batch_count: 32,
            alignment: 64,
            name: "hw_timestamps",
        }
    }

    /// Config for performance counter snapshots
    pub const fn perf_counters() -> Self {
        Self {
            batch_count: 8,
            alignment: 64,
            name: "hw_perf_counters",
        }
    }
}

impl Default for TagPoolConfig {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPoolStats {
    /// Slabs allocated, including the initial one
    pub slabs: u32,
    /// Total records across all slabs
    pub capacity: u32,
    /// Records on the free list
    pub free: u32,
    /// Records parked on the deferred list
    pub deferred: u32,
    /// Records currently handed out
    pub in_use: u32,
    /// Slabs allocated by `get` after construction
    pub growth_events: u64,
    /// Sweeps of the deferred list
    pub sweeps: u64,
    /// Records moved from deferred to free by sweeps
    pub reclaimed: u64,
}

// =============================================================================
// SLAB & NODE
// =============================================================================

/// Backing allocation shared by the nodes carved from it
struct Slab {
    memory: ManuallyDrop<DeviceAllocation>,
    allocator: Arc<dyn DeviceMemoryAllocator>,
}

impl Drop for Slab {
    fn drop(&mut self) {
        // SAFETY: memory is not touched again after drop
        let memory = unsafe { ManuallyDrop::take(&mut self.memory) };
        self.allocator.free(memory);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TagState {
    Free = 0,
    InUse = 1,
    Deferred = 2,
}

impl TagState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::InUse,
            _ => Self::Deferred,
        }
    }
}

struct TagNode<T: TagRecord> {
    slab: Arc<Slab>,
    offset: usize,
    refcount: AtomicU32,
    state: AtomicU8,
    pool: Weak<PoolInner<T>>,
}

impl<T: TagRecord> TagNode<T> {
    fn gpu_addr(&self) -> GpuAddr {
        self.slab.memory.gpu_addr() + self.offset as u64
    }

    fn state(&self) -> TagState {
        TagState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TagState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn read(&self) -> T {
        // offset + size_of::<T>() lies inside the slab by construction
        self.slab
            .memory
            .read_volatile(self.offset)
            .unwrap_or_else(|_| T::unused())
    }

    fn write(&self, value: T) {
        if let Err(e) = self.slab.memory.write_volatile(self.offset, value) {
            log::error!("{}: record write at {} failed: {}", T::NAME, self.gpu_addr(), e);
        }
    }
}

// =============================================================================
// POOL INTERNALS
// =============================================================================

type ReleasePredicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct TagLists<T: TagRecord> {
    free: Vec<Arc<TagNode<T>>>,
    deferred: Vec<Arc<TagNode<T>>>,
    stats: TagPoolStats,
}

struct PoolInner<T: TagRecord> {
    this: Weak<PoolInner<T>>,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    config: TagPoolConfig,
    stride: usize,
    predicate: ReleasePredicate<T>,
    lists: Mutex<TagLists<T>>,
}

impl<T: TagRecord> PoolInner<T> {
    /// Allocate one slab and push its records onto the free list
    fn grow_locked(&self, lists: &mut TagLists<T>) -> Result<()> {
        let batch = self.config.batch_count as usize;
        let desc = AllocDesc::new(
            AllocUsage::TagSlab,
            ByteSize::from_bytes((self.stride * batch) as u64),
        )
        .with_alignment(self.config.alignment.max(64))
        .with_name(self.config.name);

        let memory = self.allocator.allocate(&desc)?;
        let slab = Arc::new(Slab {
            memory: ManuallyDrop::new(memory),
            allocator: self.allocator.clone(),
        });

        // Reversed so pops hand out the slab front to back
        lists.free.reserve(batch);
        for i in (0..batch).rev() {
            lists.free.push(Arc::new(TagNode {
                slab: slab.clone(),
                offset: i * self.stride,
                refcount: AtomicU32::new(0),
                state: AtomicU8::new(TagState::Free as u8),
                pool: self.this.clone(),
            }));
        }

        lists.stats.slabs += 1;
        lists.stats.capacity += self.config.batch_count;
        log::info!(
            "{}: grew to {} tags in {} slabs",
            self.config.name,
            lists.stats.capacity,
            lists.stats.slabs
        );
        Ok(())
    }

    /// Move deferred records whose predicate passes to the free list
    fn sweep_locked(&self, lists: &mut TagLists<T>) -> usize {
        lists.stats.sweeps += 1;
        let mut reclaimed = 0;
        let mut i = 0;
        while i < lists.deferred.len() {
            if (self.predicate)(&lists.deferred[i].read()) {
                let node = lists.deferred.swap_remove(i);
                node.set_state(TagState::Free);
                lists.free.push(node);
                reclaimed += 1;
            } else {
                i += 1;
            }
        }
        lists.stats.reclaimed += reclaimed as u64;
        if reclaimed > 0 {
            log::trace!("{}: sweep reclaimed {} tags", self.config.name, reclaimed);
        }
        reclaimed
    }

    /// Park a record whose last reference was just dropped
    fn park(&self, node: Arc<TagNode<T>>) {
        let releasable = (self.predicate)(&node.read());
        let mut lists = self.lists.lock();
        if releasable {
            node.set_state(TagState::Free);
            lists.free.push(node);
        } else {
            log::trace!("{}: deferring tag at {}", self.config.name, node.gpu_addr());
            node.set_state(TagState::Deferred);
            lists.deferred.push(node);
        }
    }
}

// =============================================================================
// TAG HANDLE
// =============================================================================

/// One reference to a pooled tag
///
/// Dropping the handle returns the reference; the holder that drops the last
/// one parks the tag on the free or deferred list.
pub struct TagHandle<T: TagRecord> {
    node: Arc<TagNode<T>>,
}

impl<T: TagRecord> TagHandle<T> {
    /// Device address of the record
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.node.gpu_addr()
    }

    /// Current record contents
    pub fn read(&self) -> T {
        self.node.read()
    }

    /// Overwrite the record from the host
    pub fn write(&self, value: T) {
        self.node.write(value);
    }

    /// Current reference count
    pub fn refcount(&self) -> u32 {
        self.node.refcount.load(Ordering::Acquire)
    }

    /// Take an additional reference
    pub fn share(&self) -> Self {
        self.node.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            node: self.node.clone(),
        }
    }

    /// Check if both handles reference the same tag
    pub fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Check the record's own release condition
    pub fn is_released(&self) -> bool {
        self.read().can_be_released()
    }

    /// Drop this reference to a tag whose record will never be executed
    pub fn discard(self) {
        self.node.write(T::unused());
    }
}

impl<T: TagRecord> Drop for TagHandle<T> {
    fn drop(&mut self) {
        if self.node.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(pool) = self.node.pool.upgrade() {
                pool.park(self.node.clone());
            }
        }
    }
}

impl<T: TagRecord> fmt::Debug for TagHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagHandle")
            .field("pool", &T::NAME)
            .field("gpu_addr", &self.gpu_addr())
            .field("refcount", &self.refcount())
            .finish()
    }
}

// =============================================================================
// TAG ALLOCATOR
// =============================================================================

/// Pool of device-visible completion tags
///
/// Constructed once per device context and passed explicitly to whoever needs
/// tags. The first slab is allocated up front.
pub struct TagAllocator<T: TagRecord> {
    inner: Arc<PoolInner<T>>,
}

impl<T: TagRecord> TagAllocator<T> {
    /// Create a pool releasing tags by [`TagRecord::can_be_released`]
    pub fn new(allocator: Arc<dyn DeviceMemoryAllocator>, config: TagPoolConfig) -> Result<Self> {
        Self::with_predicate(allocator, config, |record: &T| record.can_be_released())
    }

    /// Create a pool with an injected release predicate
    pub fn with_predicate<F>(
        allocator: Arc<dyn DeviceMemoryAllocator>,
        config: TagPoolConfig,
        predicate: F,
    ) -> Result<Self>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if config.batch_count == 0 {
            return Err(Error::InvalidParameter);
        }
        if !config.alignment.is_power_of_two() {
            return Err(Error::MisalignedAddress);
        }

        let stride = align_up_usize(core::mem::size_of::<T>(), config.alignment as usize);
        let inner = Arc::new_cyclic(|this| PoolInner {
            this: this.clone(),
            allocator,
            config,
            stride,
            predicate: Box::new(predicate),
            lists: Mutex::new(TagLists {
                free: Vec::new(),
                deferred: Vec::new(),
                stats: TagPoolStats::default(),
            }),
        });

        {
            let mut lists = inner.lists.lock();
            inner.grow_locked(&mut lists)?;
        }

        Ok(Self { inner })
    }

    /// Hand out a tag with refcount 1 and a freshly initialized record
    pub fn get(&self) -> Result<TagHandle<T>> {
        let node = {
            let mut lists = self.inner.lists.lock();
            if lists.free.is_empty() {
                self.inner.sweep_locked(&mut lists);
            }
            if lists.free.is_empty() {
                self.inner.grow_locked(&mut lists)?;
                lists.stats.growth_events += 1;
            }
            let node = lists.free.pop().ok_or(Error::OutOfResources)?;

            if node.refcount.load(Ordering::Acquire) != 0 || node.state() != TagState::Free {
                log::error!(
                    "{}: tag at {} on free list while referenced",
                    self.inner.config.name,
                    node.gpu_addr()
                );
                return Err(Invariant::TagStillReferenced.into());
            }

            node.refcount.store(1, Ordering::Release);
            node.set_state(TagState::InUse);
            node
        };

        node.write(T::initial());
        Ok(TagHandle { node })
    }

    /// Return one reference
    ///
    /// Equivalent to dropping the handle; rejects handles from another pool
    /// after returning them to their own.
    pub fn return_tag(&self, tag: TagHandle<T>) -> Result<()> {
        let owned = core::ptr::eq(tag.node.pool.as_ptr(), Arc::as_ptr(&self.inner));
        drop(tag);
        if owned { Ok(()) } else { Err(Error::InvalidParameter) }
    }

    /// Re-check deferred tags; returns how many became free
    pub fn sweep(&self) -> usize {
        let mut lists = self.inner.lists.lock();
        self.inner.sweep_locked(&mut lists)
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> TagPoolStats {
        let lists = self.inner.lists.lock();
        let mut stats = lists.stats.clone();
        stats.free = lists.free.len() as u32;
        stats.deferred = lists.deferred.len() as u32;
        stats.in_use = stats.capacity - stats.free - stats.deferred;
        stats
    }

    /// Get pool configuration
    pub fn config(&self) -> &TagPoolConfig {
        &self.inner.config
    }

    /// Bytes between consecutive records in a slab
    pub fn stride(&self) -> usize {
        self.inner.stride
    }
}

impl<T: TagRecord> fmt::Debug for TagAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagAllocator")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

static_assertions::assert_impl_all!(TagHandle<crate::TimestampPacket>: Send, Sync);
static_assertions::assert_impl_all!(TagAllocator<crate::TimestampPacket>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysmem::HostAllocator;
    use crate::timestamp::{HwTimeStamps, TimestampPacket};
    use core::sync::atomic::AtomicUsize;
    use std::thread;

    fn host() -> (Arc<HostAllocator>, Arc<dyn DeviceMemoryAllocator>) {
        let host = Arc::new(HostAllocator::new());
        let dyn_host: Arc<dyn DeviceMemoryAllocator> = host.clone();
        (host, dyn_host)
    }

    fn complete(tag: &TagHandle<TimestampPacket>) {
        let mut packet = tag.read();
        packet.context_end = 0;
        packet.global_end = 0;
        tag.write(packet);
    }

    #[test]
    fn test_batch_exhaustion_grows_once() {
        let (_host, alloc) = host();
        let pool: TagAllocator<HwTimeStamps> =
            TagAllocator::new(alloc, TagPoolConfig::new(10)).unwrap();

        let tags: Vec<_> = (0..11).map(|_| pool.get().unwrap()).collect();
        let stats = pool.stats();
        assert_eq!(stats.growth_events, 1);
        assert_eq!(stats.slabs, 2);
        assert_eq!(stats.in_use, 11);
        assert_eq!(tags.len(), 11);
    }

    #[test]
    fn test_preallocated_slab_is_not_growth() {
        let (host, alloc) = host();
        let pool: TagAllocator<HwTimeStamps> =
            TagAllocator::new(alloc, TagPoolConfig::new(4)).unwrap();
        assert_eq!(host.live_count(AllocUsage::TagSlab), 1);

        let _tags: Vec<_> = (0..4).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.stats().growth_events, 0);
    }

    #[test]
    fn test_distinct_addresses_and_initialization() {
        let (_host, alloc) = host();
        let pool: TagAllocator<TimestampPacket> =
            TagAllocator::new(alloc, TagPoolConfig::new(4)).unwrap();

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(a.gpu_addr(), b.gpu_addr());
        assert_eq!(b.gpu_addr() - a.gpu_addr(), pool.stride() as u64);
        assert_eq!(a.read(), TimestampPacket::initial());
        assert_eq!(a.refcount(), 1);
    }

    #[test]
    fn test_released_tag_is_reused() {
        let (_host, alloc) = host();
        let pool: TagAllocator<TimestampPacket> =
            TagAllocator::new(alloc, TagPoolConfig::new(1)).unwrap();

        let tag = pool.get().unwrap();
        let addr = tag.gpu_addr();
        complete(&tag);
        pool.return_tag(tag).unwrap();
        assert_eq!(pool.stats().free, 1);

        let again = pool.get().unwrap();
        assert_eq!(again.gpu_addr(), addr);
        assert_eq!(again.read(), TimestampPacket::initial());
        assert_eq!(pool.stats().growth_events, 0);
    }

    #[test]
    fn test_unreleased_tag_is_deferred() {
        let (_host, alloc) = host();
        let pool: TagAllocator<TimestampPacket> =
            TagAllocator::new(alloc, TagPoolConfig::new(2)).unwrap();

        let busy = pool.get().unwrap();
        let busy_addr = busy.gpu_addr();
        drop(busy);

        let stats = pool.stats();
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.free, 1);

        // The free tag is handed out, never the deferred one
        let other = pool.get().unwrap();
        assert_ne!(other.gpu_addr(), busy_addr);
        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.stats().deferred, 1);
    }

    #[test]
    fn test_deferred_tag_swept_when_predicate_flips() {
        let (_host, alloc) = host();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        // Device "catches up" after the third evaluation
        let pool: TagAllocator<HwTimeStamps> = TagAllocator::with_predicate(
            alloc,
            TagPoolConfig::new(1),
            move |_| counter.fetch_add(1, Ordering::SeqCst) >= 2,
        )
        .unwrap();

        let tag = pool.get().unwrap();
        let addr = tag.gpu_addr();
        drop(tag); // evaluation 1: deferred
        assert_eq!(pool.stats().deferred, 1);

        assert_eq!(pool.sweep(), 0); // evaluation 2
        assert_eq!(pool.stats().deferred, 1);

        // Free list empty: get() sweeps first (evaluation 3) instead of growing
        let again = pool.get().unwrap();
        assert_eq!(again.gpu_addr(), addr);
        let stats = pool.stats();
        assert_eq!(stats.growth_events, 0);
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_shared_tag_parks_on_last_reference() {
        let (_host, alloc) = host();
        let pool: TagAllocator<HwTimeStamps> =
            TagAllocator::new(alloc, TagPoolConfig::new(1)).unwrap();

        let tag = pool.get().unwrap();
        let observer = tag.share();
        assert_eq!(tag.refcount(), 2);
        assert!(tag.is_same(&observer));

        pool.return_tag(tag).unwrap();
        assert_eq!(observer.refcount(), 1);
        assert_eq!(pool.stats().in_use, 1);

        // Pool exhausted while observed: next get grows
        let extra = pool.get().unwrap();
        assert!(!extra.is_same(&observer));
        assert_eq!(pool.stats().growth_events, 1);

        drop(observer);
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn test_discard_makes_packet_releasable() {
        let (_host, alloc) = host();
        let pool: TagAllocator<TimestampPacket> =
            TagAllocator::new(alloc, TagPoolConfig::new(1)).unwrap();

        let tag = pool.get().unwrap();
        tag.discard();
        let stats = pool.stats();
        assert_eq!(stats.free, 1);
        assert_eq!(stats.deferred, 0);
    }

    #[test]
    fn test_growth_failure_keeps_existing_tags() {
        let host = Arc::new(HostAllocator::new());
        let alloc: Arc<dyn DeviceMemoryAllocator> = host.clone();
        let pool: TagAllocator<TimestampPacket> =
            TagAllocator::new(alloc, TagPoolConfig::new(2)).unwrap();
        host.set_budget(Some(ByteSize::from_bytes(host.stats().bytes_in_use)));

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(pool.get().unwrap_err(), Error::OutOfResources);

        // Existing tags remain valid
        complete(&a);
        assert!(a.is_released());
        assert!(!b.is_released());
        let stats = pool.stats();
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.growth_events, 0);

        host.set_budget(None);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn test_return_to_foreign_pool_rejected() {
        let (_host, alloc) = host();
        let first: TagAllocator<HwTimeStamps> =
            TagAllocator::new(alloc.clone(), TagPoolConfig::new(1)).unwrap();
        let second: TagAllocator<HwTimeStamps> =
            TagAllocator::new(alloc, TagPoolConfig::new(1)).unwrap();

        let tag = first.get().unwrap();
        assert_eq!(second.return_tag(tag), Err(Error::InvalidParameter));
        // Still landed back in its own pool
        assert_eq!(first.stats().free, 1);
        assert_eq!(second.stats().free, 1);
    }

    #[test]
    fn test_invalid_config() {
        let (_host, alloc) = host();
        let zero = TagAllocator::<HwTimeStamps>::new(alloc.clone(), TagPoolConfig::new(0));
        assert_eq!(zero.unwrap_err(), Error::InvalidParameter);

        let mut odd = TagPoolConfig::new(4);
        odd.alignment = 48;
        let odd = TagAllocator::<HwTimeStamps>::new(alloc, odd);
        assert_eq!(odd.unwrap_err(), Error::MisalignedAddress);
    }

    #[test]
    fn test_slabs_freed_after_pool_and_handles_drop() {
        let (host, alloc) = host();
        let pool: TagAllocator<HwTimeStamps> =
            TagAllocator::new(alloc, TagPoolConfig::new(2)).unwrap();
        let tag = pool.get().unwrap();

        drop(pool);
        // Outstanding handle keeps the slab mapped
        assert_eq!(host.live_count(AllocUsage::TagSlab), 1);
        tag.write(HwTimeStamps::initial());
        drop(tag);
        assert_eq!(host.live_count(AllocUsage::TagSlab), 0);
    }

    #[test]
    fn test_concurrent_get_and_return() {
        let (_host, alloc) = host();
        let pool: Arc<TagAllocator<HwTimeStamps>> =
            Arc::new(TagAllocator::new(alloc, TagPoolConfig::new(8)).unwrap());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let tag = pool.get().unwrap();
                        let observer = tag.share();
                        drop(tag);
                        assert_eq!(observer.refcount(), 1);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free + stats.deferred, stats.capacity);
        assert!(stats.capacity <= 8 * 4);
    }
}
