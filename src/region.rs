use crate::common::{volume, DimSize, Shape};
use crate::utils::join_into_string;

use itertools::izip;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A rectangular sub-region of a tensor: an offset and an extent per dimension.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Deserialize, Serialize)]
pub struct Region {
    offsets: Shape,
    shape: Shape,
}

/// Padding around the two spatial dimensions of a windowed operation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug, Deserialize, Serialize)]
pub struct PadInfo {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("Region of rank {region} does not apply to shape of rank {shape}")]
    RankMismatch { region: usize, shape: usize },
    #[error("Region {region} exceeds shape {shape:?} in dimension {dim}")]
    OutOfBounds {
        region: Region,
        shape: Shape,
        dim: usize,
    },
}

impl Region {
    pub fn new(offsets: Shape, shape: Shape) -> Self {
        assert_eq!(
            offsets.len(),
            shape.len(),
            "Region offsets {:?} and shape {:?} differ in rank",
            offsets,
            shape
        );
        Region { offsets, shape }
    }

    /// The region covering all of `shape`.
    pub fn full(shape: &[DimSize]) -> Self {
        Region {
            offsets: smallvec::smallvec![0; shape.len()],
            shape: Shape::from(shape),
        }
    }

    pub fn offsets(&self) -> &[DimSize] {
        &self.offsets
    }

    pub fn shape(&self) -> &[DimSize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn volume(&self) -> u64 {
        volume(&self.shape)
    }

    /// The exclusive end coordinate in `dim`.
    pub fn end(&self, dim: usize) -> DimSize {
        self.offsets[dim] + self.shape[dim]
    }

    pub fn is_full(&self, shape: &[DimSize]) -> bool {
        self.offsets.iter().all(|&o| o == 0) && self.shape.as_slice() == shape
    }

    /// Checks `0 <= offset[i]` and `offset[i] + extent[i] <= shape[i]` for all `i`.
    pub fn check_within(&self, shape: &[DimSize]) -> Result<(), RegionError> {
        if shape.len() != self.rank() {
            return Err(RegionError::RankMismatch {
                region: self.rank(),
                shape: shape.len(),
            });
        }
        for (dim, (&o, &s, &bound)) in izip!(&self.offsets, &self.shape, shape).enumerate() {
            if u64::from(o) + u64::from(s) > u64::from(bound) {
                return Err(RegionError::OutOfBounds {
                    region: self.clone(),
                    shape: Shape::from(shape),
                    dim,
                });
            }
        }
        Ok(())
    }

    pub fn intersects(&self, other: &Region) -> bool {
        debug_assert_eq!(self.rank(), other.rank());
        (0..self.rank()).all(|d| self.offsets[d] < other.end(d) && other.offsets[d] < self.end(d))
    }

    /// Translates `inner`, given relative to this region, into the coordinates of the
    /// tensor this region was taken from.
    pub fn compose(&self, inner: &Region) -> Region {
        debug_assert_eq!(self.rank(), inner.rank());
        Region {
            offsets: izip!(&self.offsets, &inner.offsets)
                .map(|(a, b)| a + b)
                .collect(),
            shape: inner.shape.clone(),
        }
    }

    pub(crate) fn with_dim(mut self, dim: usize, offset: DimSize, size: DimSize) -> Region {
        self.offsets[dim] = offset;
        self.shape[dim] = size;
        self
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]+[{}]",
            join_into_string(&self.offsets, ", "),
            join_into_string(&self.shape, "×")
        )
    }
}

impl PadInfo {
    pub fn new(top: u32, bottom: u32, left: u32, right: u32) -> Self {
        PadInfo {
            top,
            bottom,
            left,
            right,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == PadInfo::default()
    }
}

impl Display for PadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pad(t={}, b={}, l={}, r={})",
            self.top, self.bottom, self.left, self.right
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn test_region_bounds() {
        let r = Region::new(shape![0, 2], shape![4, 3]);
        assert!(r.check_within(&shape![4, 5]).is_ok());
        assert_eq!(
            r.check_within(&shape![4, 4]),
            Err(RegionError::OutOfBounds {
                region: r.clone(),
                shape: shape![4, 4],
                dim: 1
            })
        );
        assert!(matches!(
            r.check_within(&shape![4]),
            Err(RegionError::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_region_intersection() {
        let a = Region::new(shape![0, 0], shape![2, 2]);
        let b = Region::new(shape![2, 0], shape![2, 2]);
        let c = Region::new(shape![1, 1], shape![2, 2]);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
    }

    #[test]
    fn test_compose_translates_offsets() {
        let outer = Region::new(shape![4, 8], shape![4, 4]);
        let inner = Region::new(shape![1, 2], shape![2, 2]);
        assert_eq!(
            outer.compose(&inner),
            Region::new(shape![5, 10], shape![2, 2])
        );
    }

    #[test]
    fn test_full_region() {
        let r = Region::full(&[3, 4]);
        assert!(r.is_full(&[3, 4]));
        assert_eq!(r.volume(), 12);
        assert_eq!(r.to_string(), "[0, 0]+[3×4]");
    }
}
