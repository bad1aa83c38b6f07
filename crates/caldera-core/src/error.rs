//! # CALDERA Error Handling
//!
//! Error types shared by the partitioner, tag pools, encoder and bundler.
//!
//! Error handling in CALDERA follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Nothing is retried internally; errors surface to the entry point
//! - Errors are `no_std` compatible and `Copy`

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CALDERA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CALDERA unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Access outside the bounds of an allocation
    OutOfBounds,
    /// Address or size not aligned
    MisalignedAddress,

    // =========================================================================
    // Dispatch Errors
    // =========================================================================
    /// Requested or derived work-group geometry cannot be honoured
    InvalidGeometry(GeometryError),
    /// Device memory exhausted while growing a pool, heap or stream
    OutOfResources,
    /// Internal accounting broke; the triggering call must not continue
    InvariantViolation(Invariant),
}

impl Error {
    /// Check if the error signals an accounting bug rather than an
    /// environmental condition
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::OutOfBounds => write!(f, "access out of bounds"),
            Self::MisalignedAddress => write!(f, "misaligned address"),

            // Dispatch
            Self::InvalidGeometry(e) => write!(f, "invalid work geometry: {}", e),
            Self::OutOfResources => write!(f, "out of device resources"),
            Self::InvariantViolation(i) => write!(f, "invariant violated: {}", i),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Why a work-group geometry was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// Dimensionality outside `1..=3`
    InvalidDimensions,
    /// A global extent of zero
    ZeroExtent,
    /// A group size component of zero
    ZeroGroupSize,
    /// Extent, offset or group size set beyond the job's dimensionality
    TrailingDimension,
    /// Group size exceeds the device's per-dimension or total limit
    ExceedsDeviceLimit,
    /// Extent is not a multiple of the group size and remainders are disallowed
    NonUniform {
        /// Offending dimension (0-based)
        dim: u8,
    },
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDimensions => write!(f, "dimensionality must be 1, 2 or 3"),
            Self::ZeroExtent => write!(f, "global extent of zero"),
            Self::ZeroGroupSize => write!(f, "group size of zero"),
            Self::TrailingDimension => write!(f, "value set beyond active dimensions"),
            Self::ExceedsDeviceLimit => write!(f, "group size exceeds device limit"),
            Self::NonUniform { dim } => {
                write!(f, "extent not divisible by group size in dimension {}", dim)
            }
        }
    }
}

/// Internal invariants whose violation aborts the triggering call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invariant {
    /// Instruction buffer too small for bytes that were already sized
    StreamOverflow,
    /// Heap too small for space that was already sized
    HeapOverflow,
    /// A tag left the free list while something still referenced it
    TagStillReferenced,
    /// A bundle was driven through an illegal state transition
    BundleState,
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamOverflow => write!(f, "instruction stream overflow"),
            Self::HeapOverflow => write!(f, "heap overflow"),
            Self::TagStillReferenced => write!(f, "tag reused while referenced"),
            Self::BundleState => write!(f, "illegal bundle state transition"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<GeometryError> for Error {
    fn from(e: GeometryError) -> Self {
        Error::InvalidGeometry(e)
    }
}

impl From<Invariant> for Error {
    fn from(i: Invariant) -> Self {
        Error::InvariantViolation(i)
    }
}
