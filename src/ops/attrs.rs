use crate::common::{DimSize, Shape};
use crate::region::{PadInfo, Region};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

/// Attributes of the operation kinds which take part in tiling.
///
/// Each variant is validated when constructed, so tiling code never has to re-check
/// for zero strides or empty kernels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum OpAttrs {
    None,
    Conv(ConvAttrs),
    Pool(PoolAttrs),
    Reduce(ReduceAttrs),
    Softmax { axis: u8 },
    /// The region of the operand which is copied out.
    Slice(Region),
    /// Where each input lands in the output.
    Concat { offsets: Vec<Shape> },
    Reshape { shape: Shape },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ConvAttrs {
    strides: [u32; 2],
    dilations: [u32; 2],
    pads: PadInfo,
    groups: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PoolAttrs {
    kernel: [u32; 2],
    strides: [u32; 2],
    pads: PadInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ReduceAttrs {
    axes: SmallVec<[u8; 4]>,
    keep_dims: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AttrError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("Padding {pad} is not smaller than the effective kernel extent {extent}")]
    PadTooLarge { pad: u32, extent: u32 },
    #[error("Reduction axes {0:?} are empty or repeated")]
    BadAxes(Vec<u8>),
}

impl ConvAttrs {
    pub fn new(
        strides: [u32; 2],
        dilations: [u32; 2],
        pads: PadInfo,
        groups: u32,
    ) -> Result<Self, AttrError> {
        if strides.contains(&0) {
            return Err(AttrError::Zero("stride"));
        }
        if dilations.contains(&0) {
            return Err(AttrError::Zero("dilation"));
        }
        if groups == 0 {
            return Err(AttrError::Zero("groups"));
        }
        Ok(ConvAttrs {
            strides,
            dilations,
            pads,
            groups,
        })
    }

    /// Unit strides and dilations, no padding, one group.
    pub fn unit() -> Self {
        ConvAttrs {
            strides: [1, 1],
            dilations: [1, 1],
            pads: PadInfo::default(),
            groups: 1,
        }
    }

    pub fn strides(&self) -> [u32; 2] {
        self.strides
    }

    pub fn dilations(&self) -> [u32; 2] {
        self.dilations
    }

    pub fn pads(&self) -> PadInfo {
        self.pads
    }

    pub fn groups(&self) -> u32 {
        self.groups
    }

    pub fn with_pads(self, pads: PadInfo) -> Self {
        ConvAttrs { pads, ..self }
    }

    pub fn with_groups(self, groups: u32) -> Self {
        debug_assert_ne!(groups, 0);
        ConvAttrs { groups, ..self }
    }
}

impl PoolAttrs {
    pub fn new(kernel: [u32; 2], strides: [u32; 2], pads: PadInfo) -> Result<Self, AttrError> {
        if kernel.contains(&0) {
            return Err(AttrError::Zero("kernel"));
        }
        if strides.contains(&0) {
            return Err(AttrError::Zero("stride"));
        }
        // A window made only of padding has nothing to pool.
        for (pad, extent) in [
            (pads.top.max(pads.bottom), kernel[0]),
            (pads.left.max(pads.right), kernel[1]),
        ] {
            if pad >= extent {
                return Err(AttrError::PadTooLarge { pad, extent });
            }
        }
        Ok(PoolAttrs {
            kernel,
            strides,
            pads,
        })
    }

    pub fn kernel(&self) -> [u32; 2] {
        self.kernel
    }

    pub fn strides(&self) -> [u32; 2] {
        self.strides
    }

    pub fn pads(&self) -> PadInfo {
        self.pads
    }

    pub fn with_pads(self, pads: PadInfo) -> Self {
        PoolAttrs { pads, ..self }
    }
}

impl ReduceAttrs {
    pub fn new(axes: &[u8], keep_dims: bool) -> Result<Self, AttrError> {
        let mut sorted: SmallVec<[u8; 4]> = SmallVec::from_slice(axes);
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.is_empty() || sorted.len() != axes.len() {
            return Err(AttrError::BadAxes(axes.to_vec()));
        }
        Ok(ReduceAttrs {
            axes: sorted,
            keep_dims,
        })
    }

    /// Reduced input axes, ascending.
    pub fn axes(&self) -> &[u8] {
        &self.axes
    }

    pub fn keep_dims(&self) -> bool {
        self.keep_dims
    }

    pub fn reduces(&self, dim: usize) -> bool {
        self.axes.iter().any(|&a| usize::from(a) == dim)
    }
}

impl Display for OpAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpAttrs::None => Ok(()),
            OpAttrs::Conv(c) => {
                write!(f, "s={:?} d={:?} {}", c.strides, c.dilations, c.pads)?;
                if c.groups != 1 {
                    write!(f, " g={}", c.groups)?;
                }
                Ok(())
            }
            OpAttrs::Pool(p) => write!(f, "k={:?} s={:?} {}", p.kernel, p.strides, p.pads),
            OpAttrs::Reduce(r) => {
                write!(f, "axes={:?} keep_dims={}", r.axes.as_slice(), r.keep_dims)
            }
            OpAttrs::Softmax { axis } => write!(f, "axis={axis}"),
            OpAttrs::Slice(region) => write!(f, "{region}"),
            OpAttrs::Concat { offsets } => write!(f, "{} inputs", offsets.len()),
            OpAttrs::Reshape { shape } => write!(f, "to {:?}", shape.as_slice()),
        }
    }
}

/// The extent covered by a kernel of size `kernel` with `dilation`, or `None` for an
/// empty kernel or one too large to represent.
pub fn effective_kernel(kernel: DimSize, dilation: u32) -> Option<DimSize> {
    kernel.checked_sub(1)?.checked_mul(dilation)?.checked_add(1)
}
