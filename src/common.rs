use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub type DimSize = u32;
pub type Shape = smallvec::SmallVec<[DimSize; 5]>;

/// Logical dimensions of 4-D activations (NCHW).
pub mod act {
    pub const N: usize = 0;
    pub const C: usize = 1;
    pub const H: usize = 2;
    pub const W: usize = 3;
}

/// Logical dimensions of 4-D convolution filters (OIYX).
pub mod filter {
    pub const OC: usize = 0;
    pub const IC: usize = 1;
    pub const KY: usize = 2;
    pub const KX: usize = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum NumericKind {
    Unsigned,
    Signed,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Bool,
    Uint4,
    Sint4,
    Uint8,
    Sint8,
    Float16,
    Bfloat16,
    Sint32,
    Uint32,
    Float32,
}

impl Dtype {
    /// The bits required to represent a value of this Dtype.
    pub fn bits(&self) -> u32 {
        match self {
            Dtype::Bool => 1,
            Dtype::Uint4 | Dtype::Sint4 => 4,
            Dtype::Uint8 | Dtype::Sint8 => 8,
            Dtype::Float16 | Dtype::Bfloat16 => 16,
            Dtype::Sint32 | Dtype::Uint32 | Dtype::Float32 => 32,
        }
    }

    pub fn kind(&self) -> NumericKind {
        match self {
            Dtype::Bool | Dtype::Uint4 | Dtype::Uint8 | Dtype::Uint32 => NumericKind::Unsigned,
            Dtype::Sint4 | Dtype::Sint8 | Dtype::Sint32 => NumericKind::Signed,
            Dtype::Float16 | Dtype::Bfloat16 | Dtype::Float32 => NumericKind::Float,
        }
    }

    /// Bytes needed to store `count` values, packed, rounded up to a whole byte.
    pub fn bytes_for(&self, count: u64) -> u64 {
        divrem::DivCeil::div_ceil(count * u64::from(self.bits()), 8)
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Bool => write!(f, "i1"),
            Dtype::Uint4 => write!(f, "u4"),
            Dtype::Sint4 => write!(f, "i4"),
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

pub fn volume(shape: &[DimSize]) -> u64 {
    shape.iter().map(|&d| u64::from(d)).product()
}

#[macro_export]
macro_rules! shape {
    ($dim:expr; $n:expr) => {{
        let sv: $crate::common::Shape = $crate::smallvec::smallvec![ $dim; $n ];
        sv
    }};
    ($($dim:expr),*$(,)*) => {{
        // Bind to a variable with an explicit type to help out type inference.
        let sv: $crate::common::Shape = $crate::smallvec::smallvec![ $( $dim ),* ];
        sv
    }};
}
