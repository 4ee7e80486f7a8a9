use crate::common::{volume, DimSize, Dtype, Shape};
use crate::layout::{row_major, DimsOrder, LayoutError};
use crate::region::{Region, RegionError};
use crate::sparse::{SparseError, SparseTensor};
use crate::utils::join_into_string;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// An immutable description of one tensor.
///
/// Every transformation returns a new [TensorSpec]. Transformations which would leave
/// a per-axis quantization out of step with the shape fail rather than guess.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct TensorSpec {
    shape: Shape,
    dtype: Dtype,
    order: DimsOrder,
    space: MemorySpace,
    quant: Option<Quant>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize, Serialize, strum::Display)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum MemorySpace {
    #[strum(serialize = "ddr")]
    Ddr,
    /// The accelerator's local scratchpad.
    #[strum(serialize = "cmx")]
    Cmx,
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub enum Quant {
    PerTensor {
        scale: f64,
        zero_point: i64,
    },
    /// One scale and zero point per index of `axis`.
    PerAxis {
        axis: u8,
        scales: Vec<f64>,
        zero_points: Vec<i64>,
    },
}

/// A dense or sparse tensor type; what an operation operand or result carries.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub enum TensorType {
    Dense(TensorSpec),
    Sparse(SparseTensor),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("Cannot reshape {from:?} ({from_volume} elements) to {to:?} ({to_volume} elements)")]
    VolumeMismatch {
        from: Shape,
        from_volume: u64,
        to: Shape,
        to_volume: u64,
    },
    #[error("Quantization axis {axis} has {scales} scales but the dimension has size {size}")]
    QuantAxisMismatch { axis: u8, scales: usize, size: DimSize },
    #[error("Reshape to {0:?} does not preserve the quantization axis")]
    QuantAxisBroken(Shape),
    #[error("Cannot pad the quantization axis {0}")]
    QuantAxisPadded(u8),
    #[error("Expected rank {expected}, got rank {got}")]
    RankMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Sparse(#[from] SparseError),
}

impl TensorSpec {
    /// A compact, row-major, unquantized tensor in off-chip memory.
    pub fn new(shape: Shape, dtype: Dtype) -> Self {
        let rank = u8::try_from(shape.len()).expect("rank should fit in u8");
        TensorSpec {
            shape,
            dtype,
            order: row_major(rank),
            space: MemorySpace::Ddr,
            quant: None,
        }
    }

    pub fn with_order(mut self, order: DimsOrder) -> Result<Self, TensorError> {
        if order.rank() != self.shape.len() {
            return Err(TensorError::RankMismatch {
                expected: self.shape.len(),
                got: order.rank(),
            });
        }
        self.order = order;
        Ok(self)
    }

    pub fn with_quant(mut self, quant: Quant) -> Result<Self, TensorError> {
        check_quant(&self.shape, &quant)?;
        self.quant = Some(quant);
        Ok(self)
    }

    pub fn in_space(mut self, space: MemorySpace) -> Self {
        self.space = space;
        self
    }

    pub fn shape(&self) -> &[DimSize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn order(&self) -> &DimsOrder {
        &self.order
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn quant(&self) -> Option<&Quant> {
        self.quant.as_ref()
    }

    pub fn volume(&self) -> u64 {
        volume(&self.shape)
    }

    pub fn elem_bits(&self) -> u32 {
        self.dtype.bits()
    }

    /// Bytes needed to hold the tensor compactly.
    pub fn total_alloc_size(&self) -> u64 {
        self.dtype.bytes_for(self.volume())
    }

    pub fn bit_strides(&self) -> Vec<u64> {
        self.order
            .bit_strides(&self.shape, self.elem_bits())
            .expect("order rank is checked on construction")
    }

    /// Per-dimension strides in bytes, or `None` for sub-byte element types.
    pub fn byte_strides(&self) -> Option<Vec<u64>> {
        if self.elem_bits() % 8 != 0 {
            return None;
        }
        Some(self.bit_strides().into_iter().map(|s| s / 8).collect())
    }

    /// Returns the same tensor with a different shape, keeping its order if the rank
    /// is unchanged.
    ///
    /// Unlike [TensorSpec::reshape], this does not preserve the volume; it describes a
    /// different (e.g., tiled or padded) tensor of the same kind.
    pub fn change_shape(&self, shape: &[DimSize]) -> Result<Self, TensorError> {
        let order = if shape.len() == self.shape.len() {
            self.order.clone()
        } else {
            row_major(u8::try_from(shape.len()).expect("rank should fit in u8"))
        };
        if let Some(quant) = &self.quant {
            check_quant(shape, quant)?;
        }
        Ok(TensorSpec {
            shape: Shape::from(shape),
            dtype: self.dtype,
            order,
            space: self.space,
            quant: self.quant.clone(),
        })
    }

    /// A pure reshape: the element count must be unchanged.
    pub fn reshape(&self, shape: &[DimSize]) -> Result<Self, TensorError> {
        let (from_volume, to_volume) = (self.volume(), volume(shape));
        if from_volume != to_volume {
            return Err(TensorError::VolumeMismatch {
                from: self.shape.clone(),
                from_volume,
                to: Shape::from(shape),
                to_volume,
            });
        }
        let quant = match &self.quant {
            Some(Quant::PerAxis {
                axis,
                scales,
                zero_points,
            }) => {
                let new_axis = remap_axis(&self.shape, usize::from(*axis), shape)
                    .ok_or_else(|| TensorError::QuantAxisBroken(Shape::from(shape)))?;
                Some(Quant::PerAxis {
                    axis: new_axis,
                    scales: scales.clone(),
                    zero_points: zero_points.clone(),
                })
            }
            q => q.clone(),
        };
        let rank = u8::try_from(shape.len()).expect("rank should fit in u8");
        Ok(TensorSpec {
            shape: Shape::from(shape),
            dtype: self.dtype,
            order: row_major(rank),
            space: self.space,
            quant,
        })
    }

    pub fn pad(&self, before: &[DimSize], after: &[DimSize]) -> Result<Self, TensorError> {
        if before.len() != self.rank() || after.len() != self.rank() {
            return Err(TensorError::RankMismatch {
                expected: self.rank(),
                got: before.len().max(after.len()),
            });
        }
        if let Some(Quant::PerAxis { axis, .. }) = &self.quant {
            let a = usize::from(*axis);
            if before[a] != 0 || after[a] != 0 {
                return Err(TensorError::QuantAxisPadded(*axis));
            }
        }
        let mut padded = self.clone();
        for d in 0..self.rank() {
            padded.shape[d] += before[d] + after[d];
        }
        Ok(padded)
    }

    pub fn extract_tile(&self, region: &Region) -> Result<Self, TensorError> {
        region.check_within(&self.shape)?;
        let quant = match &self.quant {
            Some(Quant::PerAxis {
                axis,
                scales,
                zero_points,
            }) => {
                let a = usize::from(*axis);
                let range = region.offsets()[a] as usize..region.end(a) as usize;
                Some(Quant::PerAxis {
                    axis: *axis,
                    scales: scales[range.clone()].to_vec(),
                    zero_points: zero_points[range].to_vec(),
                })
            }
            q => q.clone(),
        };
        Ok(TensorSpec {
            shape: Shape::from(region.shape()),
            dtype: self.dtype,
            order: self.order.clone(),
            space: self.space,
            quant,
        })
    }

    pub fn change_dims_order(&self, order: DimsOrder) -> Result<Self, TensorError> {
        self.clone().with_order(order)
    }

    pub fn change_mem_space(&self, space: MemorySpace) -> Self {
        self.clone().in_space(space)
    }

    /// The same shape, order and placement with a new element type. Quantization is dropped.
    pub fn change_dtype(&self, dtype: Dtype) -> Self {
        TensorSpec {
            dtype,
            quant: None,
            ..self.clone()
        }
    }
}

impl Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}", join_into_string(&self.shape, "×"), self.dtype)?;
        if !self.order.is_row_major() {
            write!(f, ", {}", self.order)?;
        }
        if self.space != MemorySpace::Ddr {
            write!(f, ", {}", self.space)?;
        }
        if let Some(Quant::PerAxis { axis, .. }) = &self.quant {
            write!(f, ", q{axis}")?;
        }
        write!(f, ")")
    }
}

impl TensorType {
    /// The logical shape: the shape consumers index.
    pub fn shape(&self) -> Shape {
        match self {
            TensorType::Dense(t) => Shape::from(t.shape()),
            TensorType::Sparse(s) => s.shape(),
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.data().dtype()
    }

    /// The dense data descriptor.
    pub fn data(&self) -> &TensorSpec {
        match self {
            TensorType::Dense(t) => t,
            TensorType::Sparse(s) => s.data(),
        }
    }

    pub fn num_elements(&self) -> u64 {
        match self {
            TensorType::Dense(t) => t.volume(),
            TensorType::Sparse(s) => s.num_elements(),
        }
    }

    pub fn total_alloc_size(&self) -> u64 {
        match self {
            TensorType::Dense(t) => t.total_alloc_size(),
            TensorType::Sparse(s) => s.total_alloc_size(),
        }
    }

    pub fn extract_tile(&self, region: &Region) -> Result<TensorType, TensorError> {
        match self {
            TensorType::Dense(t) => t.extract_tile(region).map(TensorType::Dense),
            TensorType::Sparse(s) => s.extract_dense_tile(region).map(TensorType::Sparse),
        }
    }

    pub fn change_shape(&self, shape: &[DimSize]) -> Result<TensorType, TensorError> {
        match self {
            TensorType::Dense(t) => t.change_shape(shape).map(TensorType::Dense),
            TensorType::Sparse(s) => s.change_shape(shape).map(TensorType::Sparse),
        }
    }

    pub fn change_mem_space(&self, space: MemorySpace) -> TensorType {
        match self {
            TensorType::Dense(t) => TensorType::Dense(t.change_mem_space(space)),
            TensorType::Sparse(s) => TensorType::Sparse(s.change_mem_space(space)),
        }
    }
}

impl From<TensorSpec> for TensorType {
    fn from(spec: TensorSpec) -> Self {
        TensorType::Dense(spec)
    }
}

impl From<SparseTensor> for TensorType {
    fn from(sparse: SparseTensor) -> Self {
        TensorType::Sparse(sparse)
    }
}

impl Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorType::Dense(t) => t.fmt(f),
            TensorType::Sparse(s) => s.fmt(f),
        }
    }
}

fn check_quant(shape: &[DimSize], quant: &Quant) -> Result<(), TensorError> {
    if let Quant::PerAxis {
        axis,
        scales,
        zero_points,
    } = quant
    {
        let Some(&size) = shape.get(usize::from(*axis)) else {
            return Err(TensorError::RankMismatch {
                expected: usize::from(*axis) + 1,
                got: shape.len(),
            });
        };
        if scales.len() != size as usize || zero_points.len() != scales.len() {
            return Err(TensorError::QuantAxisMismatch {
                axis: *axis,
                scales: scales.len(),
                size,
            });
        }
    }
    Ok(())
}

/// Finds the dimension of `to` which holds exactly the values of `from[axis]` after a
/// reshape: same size, same volume of outer dimensions.
fn remap_axis(from: &[DimSize], axis: usize, to: &[DimSize]) -> Option<u8> {
    let outer = volume(&from[..axis]);
    let size = from[axis];
    let mut acc = 1u64;
    for (d, &s) in to.iter().enumerate() {
        if acc == outer && s == size {
            return u8::try_from(d).ok();
        }
        acc *= u64::from(s);
        if acc > outer {
            return None;
        }
    }
    None
}
