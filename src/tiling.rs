use crate::common::{volume, DimSize, Shape};
use crate::ops::OpAttrs;
use crate::region::{PadInfo, Region};
use crate::utils::div_ceil_u32;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Selects the variant of the tiling search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum TilingMode {
    /// Plan the operation alone.
    #[strum(serialize = "isolated")]
    Isolated,
    /// Leave room for the next operation's inputs (`next_input_bytes`) to be
    /// transferred while this one executes.
    #[strum(serialize = "prefetch")]
    Prefetch { next_input_bytes: u64 },
    /// Prefer splitting the dimension which shrinks constant operands fastest.
    #[strum(serialize = "large-constant")]
    LargeConstant,
}

/// One sub-operation of a [TilingPlan].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TileInfo {
    pub output: Region,
    /// One region per operand, back-inferred from `output`.
    pub operands: Vec<Region>,
    /// Padding still applied by this tile; only set for windowed operations.
    pub pads: Option<PadInfo>,
    /// The operation's attributes adjusted for this tile.
    pub attrs: OpAttrs,
    /// Local memory the tile needs, alignment included.
    pub required_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TilingPlan {
    pub divisors: Shape,
    pub tiles: Vec<TileInfo>,
    pub mode: TilingMode,
}

impl TilingPlan {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// True for the identity plan, which leaves the operation untouched.
    pub fn is_single(&self) -> bool {
        self.tiles.len() == 1
    }

    pub fn output_regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.tiles.iter().map(|t| &t.output)
    }

    /// Whether the plan's output regions exactly cover `shape` without overlap.
    pub fn is_partition_of(&self, shape: &[DimSize]) -> bool {
        is_partition(&self.output_regions().cloned().collect::<Vec<_>>(), shape)
    }
}

/// The size of every tile but the last when splitting `extent` into `n`.
pub fn tile_size(extent: DimSize, n: DimSize) -> DimSize {
    debug_assert_ne!(n, 0);
    div_ceil_u32(extent, n.min(extent.max(1)))
}

/// The number of tiles actually produced when splitting `extent` into `n`.
///
/// Near-equal partitions with a remainder tile cannot produce every count (7 into 5
/// yields tiles of 2, 2, 2, 1), so this may be smaller than `n`.
pub fn effective_count(extent: DimSize, n: DimSize) -> DimSize {
    if extent == 0 {
        return 1;
    }
    div_ceil_u32(extent, tile_size(extent, n))
}

/// Splits `extent` into near-equal `(offset, size)` parts; the last absorbs the remainder.
pub fn divide_dim(extent: DimSize, n: DimSize) -> Vec<(DimSize, DimSize)> {
    if extent == 0 {
        return vec![(0, 0)];
    }
    let size = tile_size(extent, n);
    (0..effective_count(extent, n))
        .map(|i| {
            let offset = i * size;
            (offset, size.min(extent - offset))
        })
        .collect()
}

/// The output regions of splitting `shape` by `divisors`, in row-major tile order.
pub fn divided_regions(shape: &[DimSize], divisors: &[DimSize]) -> Vec<Region> {
    assert_eq!(shape.len(), divisors.len());
    if shape.is_empty() {
        return vec![Region::full(shape)];
    }
    shape
        .iter()
        .zip(divisors)
        .map(|(&extent, &n)| divide_dim(extent, n))
        .multi_cartesian_product()
        .map(|parts| {
            let (offsets, sizes): (Shape, Shape) = parts.into_iter().unzip();
            Region::new(offsets, sizes)
        })
        .collect()
}

pub fn is_partition(regions: &[Region], shape: &[DimSize]) -> bool {
    if regions.iter().any(|r| r.check_within(shape).is_err()) {
        return false;
    }
    let covered: u64 = regions.iter().map(Region::volume).sum();
    if covered != volume(shape) {
        return false;
    }
    regions
        .iter()
        .tuple_combinations()
        .all(|(a, b)| a.volume() == 0 || b.volume() == 0 || !a.intersects(b))
}
