//! # CALDERA Command Submission
//!
//! Work partitioning, dispatch encoding and bundled submission for compute
//! queues.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        CommandQueue                             │
//! │            submit(jobs, dependencies, want_handle)              │
//! │                                                                 │
//! │  ┌──────────────────┐   ┌──────────────────┐                    │
//! │  │ WorkPartitioner  │──▶│ DispatchEncoder  │                    │
//! │  │ NdRange → groups │   │ size_for / heaps │                    │
//! │  └──────────────────┘   │ dispatch         │                    │
//! │                         └────────┬─────────┘                    │
//! │                    DispatchTarget│                              │
//! │               ┌──────────────────┴──────────────────┐           │
//! │               ▼                                     ▼           │
//! │  ┌──────────────────────────┐     ┌───────────────────────────┐ │
//! │  │ Live: queue stream,      │◀────│ Bundle: private stream,   │ │
//! │  │ growable heaps           │flush│ exact heaps, tags         │ │
//! │  └──────────────────────────┘     └───────────────────────────┘ │
//! │               │                                                 │
//! │  ┌────────────┴─────────────────────────────────────────────┐   │
//! │  │  DeviceContext: allocator, limits, tag pools             │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - [`DispatchEncoder::size_for`] and
//!   [`DispatchEncoder::heap_requirements`] match what a dispatch writes,
//!   byte for byte
//! - A bundle flushes as a whole or not at all
//! - Submissions reach the live stream in submission order

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod bundle;
pub mod config;
pub mod context;
pub mod encoder;
pub mod event;
pub mod job;
pub mod partition;
pub mod queue;
pub mod record;
pub mod stream;

// Re-exports
pub use bundle::{Bundle, BundleState, SubmissionBundler};
pub use config::{BundleFlushMode, ContextConfig, EncoderConfig, QueueConfig};
pub use context::DeviceContext;
pub use encoder::{
    CaptureTags, DispatchEncoder, DispatchFlags, DispatchOptions, DispatchOutcome,
    DispatchTarget, LiveTarget, ResolvedJob,
};
pub use event::{
    CompletionHandle, CompletionStamp, CompletionStatus, Dependency, EventStatus, SubmitStatus,
    UserEvent,
};
pub use job::{Job, JobKind};
pub use partition::{DeviceLimits, NdRange, WorkGeometry, WorkPartitioner, WorkPolicy};
pub use queue::{CommandQueue, LiveStream, QueueStats};
pub use record::{Decoded, Opcode, Record, RecordIter};
pub use stream::InstructionBuffer;
