use crate::common::{DimSize, Shape};
use crate::utils::join_into_string;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

/// The order in which a tensor's logical dimensions are linearized in memory.
///
/// `DimsOrder` is a permutation of `0..rank`. The first entry is the outermost
/// (slowest-varying) logical dimension and the last is the innermost. Row-major
/// order is the identity permutation; NHWC is `[0, 2, 3, 1]` over NCHW logical
/// dimensions.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Deserialize, Serialize)]
pub struct DimsOrder(SmallVec<[u8; 5]>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{0:?} is not a permutation of its dimensions")]
    NotAPermutation(Vec<u8>),
    #[error("Dimension order of rank {order} does not apply to shape of rank {shape}")]
    RankMismatch { order: usize, shape: usize },
}

pub fn row_major(rank: u8) -> DimsOrder {
    DimsOrder((0..rank).collect())
}

pub fn nhwc() -> DimsOrder {
    DimsOrder(SmallVec::from_slice(&[0, 2, 3, 1]))
}

impl DimsOrder {
    pub fn new(permutation: &[u8]) -> Result<Self, LayoutError> {
        let mut seen = vec![false; permutation.len()];
        for &d in permutation {
            match seen.get_mut(usize::from(d)) {
                Some(s) if !*s => *s = true,
                _ => return Err(LayoutError::NotAPermutation(permutation.to_vec())),
            }
        }
        Ok(DimsOrder(SmallVec::from_slice(permutation)))
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_row_major(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &d)| usize::from(d) == i)
    }

    /// Logical dimensions from outermost to innermost.
    pub fn dims(&self) -> &[u8] {
        &self.0
    }

    /// The memory position of logical dimension `dim`.
    pub fn position_of(&self, dim: u8) -> Option<usize> {
        self.0.iter().position(|&d| d == dim)
    }

    /// The shape as laid out in memory (outermost first).
    pub fn mem_shape(&self, shape: &[DimSize]) -> Result<Shape, LayoutError> {
        self.check_rank(shape)?;
        Ok(self.0.iter().map(|&d| shape[usize::from(d)]).collect())
    }

    /// Per-logical-dimension strides, in bits, of a compact tensor.
    pub fn bit_strides(&self, shape: &[DimSize], elem_bits: u32) -> Result<Vec<u64>, LayoutError> {
        self.check_rank(shape)?;
        let mut strides = vec![0; shape.len()];
        let mut inner = u64::from(elem_bits);
        for &d in self.0.iter().rev() {
            strides[usize::from(d)] = inner;
            inner *= u64::from(shape[usize::from(d)]);
        }
        Ok(strides)
    }

    fn check_rank(&self, shape: &[DimSize]) -> Result<(), LayoutError> {
        if shape.len() != self.0.len() {
            return Err(LayoutError::RankMismatch {
                order: self.0.len(),
                shape: shape.len(),
            });
        }
        Ok(())
    }
}

impl Display for DimsOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", join_into_string(&self.0, ", "))
    }
}
