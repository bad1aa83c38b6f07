//! # Work Partitioner
//!
//! Splits an iteration space into hardware-sized work-groups.
//!
//! Group size is chosen in priority order:
//!
//! 1. the job's *required* size, validated as-is
//! 2. the caller's *requested* size, clamped per dimension to the extent
//! 3. a size derived from [`DeviceLimits`] by the active [`WorkPolicy`]
//!
//! Partitioning is pure: no state, safe to call from any thread.

use alloc::vec::Vec;

use caldera_core::{Error, GeometryError, Result};

/// Maximum dimensionality of an iteration space
pub const MAX_DIMS: usize = 3;

/// Per-dimension extent, offset or size
pub type Dim3 = [u32; MAX_DIMS];

/// Power-of-two sizes tried by [`WorkPolicy::Uniform1D`]
const UNIFORM_1D_TABLE: [u32; 11] = [1024, 512, 256, 128, 64, 32, 16, 8, 4, 2, 1];

// =============================================================================
// DEVICE LIMITS
// =============================================================================

/// Work-group limits of the target device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum work-items in one group
    pub max_group_size: u32,
    /// Maximum group size per dimension
    pub max_group_dims: Dim3,
    /// Native vector (SIMD) width
    pub vector_width: u32,
}

impl DeviceLimits {
    /// Limits with a uniform per-dimension maximum
    pub const fn new(max_group_size: u32, vector_width: u32) -> Self {
        Self {
            max_group_size,
            max_group_dims: [max_group_size; MAX_DIMS],
            vector_width,
        }
    }

    /// Reject limits no device reports
    pub fn validate(&self) -> Result<()> {
        let dims_ok = self.max_group_dims.iter().all(|&d| d >= 1);
        let simd_ok = matches!(self.vector_width, 8 | 16 | 32);
        if self.max_group_size == 0 || !dims_ok || !simd_ok {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::new(256, 16)
    }
}

/// Group-size derivation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkPolicy {
    /// Table-driven against the longest dimension
    Uniform1D,
    /// Split the two largest dimensions
    Uniform2D,
    /// Roughly equal extents per active dimension
    Squared,
    /// Search all active dimensions for the fewest wasted lanes
    #[default]
    GeneralNd,
}

// =============================================================================
// ND RANGE
// =============================================================================

/// Iteration space of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    /// Dimensionality (1..=3)
    pub dims: u32,
    /// Global offset
    pub offset: Dim3,
    /// Global extent
    pub extent: Dim3,
    /// Caller-requested group size
    pub requested: Option<Dim3>,
    /// Group size fixed by the kernel; overrides `requested`
    pub required: Option<Dim3>,
    /// Allow a partial last group per dimension
    pub allow_non_uniform: bool,
}

impl NdRange {
    /// Iteration space of `dims` dimensions
    pub const fn new(dims: u32, extent: Dim3) -> Self {
        Self {
            dims,
            offset: [0; MAX_DIMS],
            extent,
            requested: None,
            required: None,
            allow_non_uniform: false,
        }
    }

    /// One-dimensional iteration space of `n` items
    pub const fn linear(n: u32) -> Self {
        Self::new(1, [n, 1, 1])
    }

    /// Set the global offset
    pub const fn with_offset(mut self, offset: Dim3) -> Self {
        self.offset = offset;
        self
    }

    /// Set a requested group size
    pub const fn with_requested(mut self, size: Dim3) -> Self {
        self.requested = Some(size);
        self
    }

    /// Set a required group size
    pub const fn with_required(mut self, size: Dim3) -> Self {
        self.required = Some(size);
        self
    }

    /// Allow remainder groups
    pub const fn non_uniform(mut self) -> Self {
        self.allow_non_uniform = true;
        self
    }

    /// Work-items in the whole space; `None` if the count overflows `u64`
    pub fn total_items(&self) -> Option<u64> {
        self.extent
            .iter()
            .try_fold(1u64, |acc, &e| acc.checked_mul(e as u64))
    }
}

/// Highest 1-based dimension whose value exceeds one; zero if none does
pub fn simplified_dim(v: &Dim3) -> u32 {
    (0..MAX_DIMS)
        .rev()
        .find(|&i| v[i] > 1)
        .map_or(0, |i| i as u32 + 1)
}

// =============================================================================
// WORK GEOMETRY
// =============================================================================

/// Resolved group geometry of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGeometry {
    /// Work-items per group, per dimension
    pub group_size: Dim3,
    /// Groups per dimension
    pub group_count: Dim3,
    /// Global extent the geometry covers
    pub extent: Dim3,
    /// Global offset of the first work-item
    pub offset: Dim3,
    /// Work-items in the whole space
    pub total_items: u64,
    /// Dimensionality used for scheduling
    pub dispatch_dims: u32,
}

impl WorkGeometry {
    fn new(range: &NdRange, group_size: Dim3, total_items: u64, dispatch_dims: u32) -> Self {
        let mut group_count = [1; MAX_DIMS];
        for i in 0..MAX_DIMS {
            group_count[i] = range.extent[i].div_ceil(group_size[i]);
        }
        Self {
            group_size,
            group_count,
            extent: range.extent,
            offset: range.offset,
            total_items,
            dispatch_dims,
        }
    }

    /// Work-items per group
    pub fn group_total(&self) -> u32 {
        self.group_size.iter().product()
    }

    /// Items in the last, partial group of `dim`; zero if it is full
    pub fn remainder(&self, dim: usize) -> u32 {
        self.extent[dim] % self.group_size[dim]
    }

    /// Check that every group is full
    pub fn is_uniform(&self) -> bool {
        (0..MAX_DIMS).all(|i| self.remainder(i) == 0)
    }

    /// Hardware threads per group at `simd` lanes each
    pub fn threads_per_group(&self, simd: u32) -> u32 {
        self.group_total().div_ceil(simd)
    }

    /// Lane mask of the last thread in a group
    pub fn right_exec_mask(&self, simd: u32) -> u32 {
        right_exec_mask(self.group_total(), simd)
    }
}

/// Lane mask of the last thread of a `group_total`-item group
pub fn right_exec_mask(group_total: u32, simd: u32) -> u32 {
    match group_total % simd {
        0 if simd >= 32 => u32::MAX,
        0 => (1 << simd) - 1,
        rem => (1 << rem) - 1,
    }
}

// =============================================================================
// PARTITIONER
// =============================================================================

/// Chooses work-group geometry for iteration spaces
#[derive(Debug, Clone, Copy)]
pub struct WorkPartitioner {
    limits: DeviceLimits,
    policy: WorkPolicy,
}

impl WorkPartitioner {
    /// Create a partitioner for `limits` using `policy`
    pub const fn new(limits: DeviceLimits, policy: WorkPolicy) -> Self {
        Self { limits, policy }
    }

    /// Get device limits
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Get derivation policy
    pub fn policy(&self) -> WorkPolicy {
        self.policy
    }

    /// Compute the geometry of `range`
    pub fn partition(&self, range: &NdRange) -> Result<WorkGeometry> {
        let total_items = validate_range(range)?;

        let dispatch_dims = simplified_dim(&range.extent)
            .max(simplified_dim(&range.offset))
            .max(1);

        let size = match (range.required, range.requested) {
            (Some(required), _) => required,
            (None, Some(requested)) => {
                let mut clamped = requested;
                for i in 0..MAX_DIMS {
                    clamped[i] = clamped[i].min(range.extent[i]);
                }
                clamped
            }
            (None, None) => self.derive(range, total_items),
        };
        self.check_size(range, &size)?;

        Ok(WorkGeometry::new(range, size, total_items, dispatch_dims))
    }

    fn check_size(&self, range: &NdRange, size: &Dim3) -> Result<()> {
        for i in 0..MAX_DIMS {
            if size[i] == 0 {
                return Err(GeometryError::ZeroGroupSize.into());
            }
            if i >= range.dims as usize && size[i] != 1 {
                return Err(GeometryError::TrailingDimension.into());
            }
            if size[i] > self.limits.max_group_dims[i] {
                return Err(GeometryError::ExceedsDeviceLimit.into());
            }
        }

        let total = size
            .iter()
            .fold(1u64, |acc, &s| acc.saturating_mul(s as u64));
        if total > self.limits.max_group_size as u64 {
            return Err(GeometryError::ExceedsDeviceLimit.into());
        }

        if !range.allow_non_uniform {
            if let Some(dim) = (0..MAX_DIMS).find(|&i| range.extent[i] % size[i] != 0) {
                return Err(GeometryError::NonUniform { dim: dim as u8 }.into());
            }
        }
        Ok(())
    }

    fn derive(&self, range: &NdRange, total_items: u64) -> Dim3 {
        let uniform = !range.allow_non_uniform;
        let work_dims = simplified_dim(&range.extent).max(1) as usize;
        match self.policy {
            WorkPolicy::Uniform1D => self.uniform_1d(&range.extent, work_dims, uniform),
            WorkPolicy::Uniform2D => self.uniform_2d(&range.extent, work_dims, uniform),
            WorkPolicy::Squared => self.squared(&range.extent, work_dims, uniform),
            WorkPolicy::GeneralNd => {
                self.general_nd(&range.extent, total_items, work_dims, uniform)
            }
        }
    }

    fn dim_limit(&self, dim: usize) -> u32 {
        self.limits.max_group_dims[dim].min(self.limits.max_group_size)
    }

    fn uniform_1d(&self, extent: &Dim3, work_dims: usize, uniform: bool) -> Dim3 {
        let axis = longest_axes(extent, work_dims)[0];
        let limit = self.dim_limit(axis).min(extent[axis]);

        let mut pick = UNIFORM_1D_TABLE
            .iter()
            .copied()
            .find(|&t| t <= limit && (!uniform || extent[axis] % t == 0))
            .unwrap_or(1);
        if pick < self.limits.vector_width {
            pick = pick.max(fit(extent[axis], limit, uniform));
        }

        let mut size = [1; MAX_DIMS];
        size[axis] = pick;
        size
    }

    fn uniform_2d(&self, extent: &Dim3, work_dims: usize, uniform: bool) -> Dim3 {
        if work_dims < 2 {
            return self.uniform_1d(extent, work_dims, uniform);
        }
        let axes = longest_axes(extent, work_dims);
        let (p, s) = (axes[0], axes[1]);
        let max = self.limits.max_group_size;

        let primary_cap = self.limits.vector_width.max(isqrt(max)).min(max);
        let mut p_size = fit(extent[p], self.dim_limit(p).min(primary_cap), uniform);
        let s_size = fit(extent[s], self.dim_limit(s).min(max / p_size), uniform);
        p_size = fit(extent[p], self.dim_limit(p).min(max / s_size), uniform);

        let mut size = [1; MAX_DIMS];
        size[p] = p_size;
        size[s] = s_size;
        size
    }

    fn squared(&self, extent: &Dim3, work_dims: usize, uniform: bool) -> Dim3 {
        let max = self.limits.max_group_size as u64;
        let mut side: u64 = 1;
        while (side * 2).pow(work_dims as u32) <= max {
            side *= 2;
        }

        let mut size = [1; MAX_DIMS];
        for i in 0..work_dims {
            size[i] = fit(extent[i], self.dim_limit(i).min(side as u32), uniform);
        }

        // Hand the slack back to x
        let rest = size[1] * size[2];
        size[0] = fit(
            extent[0],
            self.dim_limit(0).min(self.limits.max_group_size / rest),
            uniform,
        );
        size
    }

    fn general_nd(
        &self,
        extent: &Dim3,
        total_items: u64,
        work_dims: usize,
        uniform: bool,
    ) -> Dim3 {
        let max = self.limits.max_group_size as u64;
        let vw = self.limits.vector_width as u64;

        let candidates: [Vec<u32>; MAX_DIMS] = core::array::from_fn(|i| {
            if i >= work_dims {
                return alloc::vec![1];
            }
            let limit = self.dim_limit(i).min(extent[i]);
            (1..=limit)
                .filter(|&v| {
                    extent[i] % v == 0 || (!uniform && (v.is_power_of_two() || v == limit))
                })
                .collect()
        });

        let mut best = [1; MAX_DIMS];
        let mut best_key = (u64::MAX, 0u64, 0u32, 0u32);
        for &x in &candidates[0] {
            for &y in &candidates[1] {
                if x as u64 * y as u64 > max {
                    break;
                }
                for &z in &candidates[2] {
                    let group = x as u64 * y as u64 * z as u64;
                    if group > max {
                        break;
                    }
                    let groups = (extent[0].div_ceil(x) as u64)
                        .saturating_mul(extent[1].div_ceil(y) as u64)
                        .saturating_mul(extent[2].div_ceil(z) as u64);
                    let lanes = groups.saturating_mul(group.div_ceil(vw) * vw);
                    let waste = lanes.saturating_sub(total_items);

                    let better = waste < best_key.0
                        || (waste == best_key.0
                            && (group, x, y) > (best_key.1, best_key.2, best_key.3));
                    if better {
                        best_key = (waste, group, x, y);
                        best = [x, y, z];
                    }
                }
            }
        }
        best
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Check the range's shape; returns its work-item count
fn validate_range(range: &NdRange) -> Result<u64> {
    if range.dims == 0 || range.dims as usize > MAX_DIMS {
        return Err(GeometryError::InvalidDimensions.into());
    }
    if range.extent.contains(&0) {
        return Err(GeometryError::ZeroExtent.into());
    }
    for i in range.dims as usize..MAX_DIMS {
        if range.extent[i] != 1 || range.offset[i] != 0 {
            return Err(GeometryError::TrailingDimension.into());
        }
    }
    range
        .total_items()
        .ok_or_else(|| GeometryError::ExceedsDeviceLimit.into())
}

/// Active axes ordered by descending extent, lower index first on ties
fn longest_axes(extent: &Dim3, work_dims: usize) -> [usize; MAX_DIMS] {
    let mut axes = [0, 1, 2];
    axes[..work_dims].sort_by(|&a, &b| extent[b].cmp(&extent[a]).then(a.cmp(&b)));
    axes
}

/// Largest size within `limit` (and the extent), a divisor when `uniform`
fn fit(extent: u32, limit: u32, uniform: bool) -> u32 {
    let limit = limit.max(1).min(extent);
    if uniform {
        (1..=limit).rev().find(|d| extent % d == 0).unwrap_or(1)
    } else {
        limit
    }
}

fn isqrt(n: u32) -> u32 {
    let mut r: u32 = 1;
    while ((r + 1) as u64 * (r + 1) as u64) <= n as u64 {
        r += 1;
    }
    r
}
