//! # Events & Completion Handles
//!
//! Host-side dependencies and the handles callers use to observe a
//! submission.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use caldera_mem::{HwPerfCounter, HwTimeStamps, TagHandle, TimestampPacket};

use crate::encoder::CaptureTags;

// =============================================================================
// USER EVENTS
// =============================================================================

/// State of a host-signalled event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventStatus {
    /// Not signalled yet
    Pending = 0,
    /// Signalled successfully
    Complete = 1,
    /// Signalled with an error
    Failed = 2,
}

/// Event completed by the host
///
/// Submissions depending on a pending event are bundled; a failed event
/// aborts them.
#[derive(Debug)]
pub struct UserEvent {
    status: AtomicU8,
}

impl UserEvent {
    /// Create a pending event
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(EventStatus::Pending as u8),
        })
    }

    fn signal(&self, to: EventStatus) -> bool {
        self.status
            .compare_exchange(
                EventStatus::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark complete; false if already signalled
    pub fn complete(&self) -> bool {
        self.signal(EventStatus::Complete)
    }

    /// Mark failed; false if already signalled
    pub fn fail(&self) -> bool {
        self.signal(EventStatus::Failed)
    }

    /// Current status
    pub fn status(&self) -> EventStatus {
        match self.status.load(Ordering::Acquire) {
            0 => EventStatus::Pending,
            1 => EventStatus::Complete,
            _ => EventStatus::Failed,
        }
    }
}

/// Something a submission waits on
#[derive(Debug)]
pub enum Dependency {
    /// Host event; blocks the submission while pending
    Host(Arc<UserEvent>),
    /// Completion packet of earlier device work; waited on device-side
    Device(TagHandle<TimestampPacket>),
}

impl Dependency {
    /// Depend on a host event
    pub fn host(event: &Arc<UserEvent>) -> Self {
        Self::Host(event.clone())
    }

    /// Depend on a completion packet, taking a reference to it
    pub fn device(tag: &TagHandle<TimestampPacket>) -> Self {
        Self::Device(tag.share())
    }
}

// =============================================================================
// COMPLETION
// =============================================================================

/// Task count at which a submission completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompletionStamp(pub u64);

impl CompletionStamp {
    /// Check against the device's completed task count
    #[inline]
    pub fn is_reached(self, completed: u64) -> bool {
        completed >= self.0
    }
}

impl fmt::Display for CompletionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Where a submission stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Waiting in a bundle for host dependencies
    Blocked,
    /// In the live stream
    Submitted(CompletionStamp),
    /// Dropped because a dependency failed
    Aborted,
}

/// Status returned by a submit call
pub type SubmitStatus = CompletionStatus;

#[derive(Debug)]
struct HandleState {
    status: CompletionStatus,
    captures: CaptureTags,
}

/// Caller's view of one submission
///
/// Cloning yields another view of the same submission.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    state: Arc<Mutex<HandleState>>,
}

impl CompletionHandle {
    pub(crate) fn new(status: CompletionStatus, captures: CaptureTags) -> Self {
        Self {
            state: Arc::new(Mutex::new(HandleState { status, captures })),
        }
    }

    pub(crate) fn resolve(&self, stamp: CompletionStamp) {
        self.state.lock().status = CompletionStatus::Submitted(stamp);
    }

    pub(crate) fn abort(&self) {
        let mut state = self.state.lock();
        state.status = CompletionStatus::Aborted;
        // Records were never executed
        core::mem::take(&mut state.captures).discard();
    }

    /// Current status
    pub fn status(&self) -> CompletionStatus {
        self.state.lock().status
    }

    /// Completion stamp, once submitted
    pub fn stamp(&self) -> Option<CompletionStamp> {
        match self.status() {
            CompletionStatus::Submitted(stamp) => Some(stamp),
            _ => None,
        }
    }

    /// Check completion against the device's completed task count
    pub fn is_complete(&self, completed: u64) -> bool {
        self.stamp().is_some_and(|s| s.is_reached(completed))
    }

    /// Completion packet, shareable as a device dependency
    pub fn completion_tag(&self) -> Option<TagHandle<TimestampPacket>> {
        self.state.lock().captures.completion.as_ref().map(TagHandle::share)
    }

    /// Profiling timestamps
    pub fn timestamps(&self) -> Option<HwTimeStamps> {
        self.state.lock().captures.profiling.as_ref().map(TagHandle::read)
    }

    /// Performance counter snapshots
    pub fn perf_counters(&self) -> Option<HwPerfCounter> {
        self.state.lock().captures.perf.as_ref().map(TagHandle::read)
    }
}

static_assertions::assert_impl_all!(CompletionHandle: Send, Sync);
static_assertions::assert_impl_all!(Dependency: Send);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_signals_once() {
        let event = UserEvent::new();
        assert_eq!(event.status(), EventStatus::Pending);
        assert!(event.complete());
        assert!(!event.fail());
        assert_eq!(event.status(), EventStatus::Complete);

        let failed = UserEvent::new();
        assert!(failed.fail());
        assert!(!failed.complete());
        assert_eq!(failed.status(), EventStatus::Failed);
    }

    #[test]
    fn test_handle_transitions() {
        let handle = CompletionHandle::new(CompletionStatus::Blocked, CaptureTags::default());
        let view = handle.clone();
        assert_eq!(view.stamp(), None);
        assert!(!view.is_complete(u64::MAX));

        handle.resolve(CompletionStamp(3));
        assert_eq!(view.status(), CompletionStatus::Submitted(CompletionStamp(3)));
        assert!(!view.is_complete(2));
        assert!(view.is_complete(3));
        assert!(view.completion_tag().is_none());
    }

    #[test]
    fn test_aborted_handle() {
        let handle = CompletionHandle::new(CompletionStatus::Blocked, CaptureTags::default());
        handle.abort();
        assert_eq!(handle.status(), CompletionStatus::Aborted);
        assert_eq!(handle.stamp(), None);
    }
}
