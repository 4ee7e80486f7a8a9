//! The operation catalog and the back-inference registry.
//!
//! Every operation kind participates in tiling through an [OpRules] record: shape
//! inference, an optional back-inference rule (no rule means untileable), an optional
//! split-legality predicate, the output axes it reduces over, and its working set.

mod attrs;
mod data;
mod eltwise;
mod reduce;
mod window;

pub use attrs::{effective_kernel, AttrError, ConvAttrs, OpAttrs, PoolAttrs, ReduceAttrs};

use crate::common::{DimSize, Shape};
use crate::region::{PadInfo, Region};
use crate::tensorspec::{TensorError, TensorType};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum OpKind {
    Add,
    Multiply,
    NotEqual,
    Floor,
    Selu,
    Convolution,
    GroupConvolution,
    MaxPool,
    AvgPool,
    ReduceL2,
    SoftMax,
    Slice,
    Concat,
    AffineReshape,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Operation {
    kind: OpKind,
    attrs: OpAttrs,
}

/// Everything the search needs to know about one operation in its graph.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OpView {
    pub loc: String,
    pub op: Operation,
    pub operands: Vec<TensorType>,
    pub output: TensorType,
    /// Whether each operand is a constant (e.g. weights).
    pub constant: Vec<bool>,
}

/// Operand regions back-inferred from one output region.
#[derive(Debug, Clone, PartialEq)]
pub struct TileInference {
    pub operands: Vec<Region>,
    pub pads: Option<PadInfo>,
    pub attrs: OpAttrs,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InferError {
    #[error("{0} is not registered")]
    NotRegistered(OpKind),
    #[error("{kind} expects {expected} operands, got {got}")]
    OperandCount {
        kind: OpKind,
        expected: &'static str,
        got: usize,
    },
    #[error("{kind} cannot be built with attributes {attrs:?}")]
    AttrMismatch { kind: OpKind, attrs: OpAttrs },
    #[error("{kind}: incompatible operand shapes {shapes:?}")]
    Incompatible { kind: OpKind, shapes: Vec<Shape> },
    #[error("{kind}: {source}")]
    Attr { kind: OpKind, source: AttrError },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackInferError {
    #[error("Output region has rank {got}, expected {expected}")]
    RankMismatch { expected: usize, got: usize },
    #[error("Expected {expected} operand shapes, got {got}")]
    OperandCount { expected: usize, got: usize },
    #[error("Attributes {0:?} do not belong to this operation")]
    AttrMismatch(OpAttrs),
    #[error("Output channels {offset}+{size} do not align to {per_group} channels per group")]
    GroupMisaligned {
        offset: DimSize,
        size: DimSize,
        per_group: DimSize,
    },
    #[error("Inferred region {region} of operand {operand} falls outside its shape {shape:?}")]
    RegionViolation {
        operand: usize,
        region: Region,
        shape: Shape,
    },
}

/// Why a candidate split was rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum IllegalSplit {
    #[error("Tiles of {tile} channels break the {alignment}-channel alignment")]
    ChannelAlignment { tile: DimSize, alignment: DimSize },
    #[error("Tiles of {tile} channels split a group of {per_group} output channels")]
    GroupAlignment { tile: DimSize, per_group: DimSize },
    #[error("Dimension {0} is reduced over")]
    ReductionAxis(usize),
    #[error("Operand tile is inconsistent: {0}")]
    Operand(#[from] TensorError),
    #[error(transparent)]
    Inference(BackInferError),
}

pub type InferFn = fn(OpKind, &[TensorType], &OpAttrs) -> Result<TensorType, InferError>;
pub type BackInferFn = fn(&Region, &[Shape], &OpAttrs) -> Result<TileInference, BackInferError>;
/// Checks splitting output dimension `dim` into tiles of size `tile`.
pub type LegalityFn = fn(&OpView, usize, DimSize) -> Result<(), IllegalSplit>;
pub type ReductionAxesFn = fn(&OpAttrs, usize) -> Vec<usize>;
pub type BufferSizesFn = fn(&[TensorType], &TensorType) -> Vec<u64>;

#[derive(Clone, Copy)]
pub struct OpRules {
    pub infer_output: InferFn,
    pub back_infer: Option<BackInferFn>,
    pub split_legality: Option<LegalityFn>,
    /// Output axes the operation reduces over, given the attributes and output rank.
    pub reduction_axes: ReductionAxesFn,
    /// Whether tiles may split a reduction axis. No standard kind accumulates across
    /// tiles, so this is `false` throughout the standard registry.
    pub splits_reductions: bool,
    pub buffer_sizes: BufferSizesFn,
}

#[derive(Clone, Default)]
pub struct OpRegistry {
    rules: HashMap<OpKind, OpRules>,
}

impl Operation {
    pub fn new(kind: OpKind, attrs: OpAttrs) -> Result<Self, InferError> {
        let matches = match kind {
            OpKind::Add
            | OpKind::Multiply
            | OpKind::NotEqual
            | OpKind::Floor
            | OpKind::Selu => matches!(attrs, OpAttrs::None),
            OpKind::Convolution | OpKind::GroupConvolution => matches!(attrs, OpAttrs::Conv(_)),
            OpKind::MaxPool | OpKind::AvgPool => matches!(attrs, OpAttrs::Pool(_)),
            OpKind::ReduceL2 => matches!(attrs, OpAttrs::Reduce(_)),
            OpKind::SoftMax => matches!(attrs, OpAttrs::Softmax { .. }),
            OpKind::Slice => matches!(attrs, OpAttrs::Slice(_)),
            OpKind::Concat => matches!(attrs, OpAttrs::Concat { .. }),
            OpKind::AffineReshape => matches!(attrs, OpAttrs::Reshape { .. }),
        };
        if !matches {
            return Err(InferError::AttrMismatch { kind, attrs });
        }
        Ok(Operation { kind, attrs })
    }

    /// An operation without attributes, such as an element-wise one.
    pub fn simple(kind: OpKind) -> Result<Self, InferError> {
        Operation::new(kind, OpAttrs::None)
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn attrs(&self) -> &OpAttrs {
        &self.attrs
    }

    /// The same kind of operation with different attributes, as for a tile.
    pub fn with_attrs(&self, attrs: OpAttrs) -> Result<Self, InferError> {
        Operation::new(self.kind, attrs)
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attrs {
            OpAttrs::None => write!(f, "{}", self.kind),
            attrs => write!(f, "{}({})", self.kind, attrs),
        }
    }
}

impl OpView {
    pub fn operand_shapes(&self) -> Vec<Shape> {
        self.operands.iter().map(TensorType::shape).collect()
    }

    pub fn with_constants(mut self, constant: Vec<bool>) -> Self {
        assert_eq!(constant.len(), self.operands.len());
        self.constant = constant;
        self
    }
}

impl OpRegistry {
    /// The registry of every kind in the catalog.
    pub fn standard() -> Self {
        let mut registry = OpRegistry::default();
        for kind in [OpKind::Add, OpKind::Multiply, OpKind::NotEqual] {
            registry.register(kind, eltwise::binary_rules());
        }
        for kind in [OpKind::Floor, OpKind::Selu] {
            registry.register(kind, eltwise::unary_rules());
        }
        registry.register(OpKind::Convolution, window::convolution_rules());
        registry.register(OpKind::GroupConvolution, window::group_convolution_rules());
        registry.register(OpKind::MaxPool, window::pool_rules());
        registry.register(OpKind::AvgPool, window::pool_rules());
        registry.register(OpKind::ReduceL2, reduce::reduce_rules());
        registry.register(OpKind::SoftMax, reduce::softmax_rules());
        registry.register(OpKind::Slice, data::slice_rules());
        registry.register(OpKind::Concat, data::concat_rules());
        registry.register(OpKind::AffineReshape, data::reshape_rules());
        registry
    }

    /// Registers (or replaces) the rules of `kind`.
    pub fn register(&mut self, kind: OpKind, rules: OpRules) {
        self.rules.insert(kind, rules);
    }

    pub fn get(&self, kind: OpKind) -> Option<&OpRules> {
        self.rules.get(&kind)
    }

    pub fn infer_output(
        &self,
        op: &Operation,
        operands: &[TensorType],
    ) -> Result<TensorType, InferError> {
        let rules = self
            .get(op.kind)
            .ok_or(InferError::NotRegistered(op.kind))?;
        (rules.infer_output)(op.kind, operands, &op.attrs)
    }

    /// Builds an [OpView] with an inferred output and no constant operands.
    pub fn view(
        &self,
        loc: impl Into<String>,
        op: Operation,
        operands: Vec<TensorType>,
    ) -> Result<OpView, InferError> {
        let output = self.infer_output(&op, &operands)?;
        Ok(OpView {
            loc: loc.into(),
            constant: vec![false; operands.len()],
            op,
            operands,
            output,
        })
    }
}

/// Every operand plus the output are live at once.
pub fn operands_and_output(operands: &[TensorType], output: &TensorType) -> Vec<u64> {
    operands
        .iter()
        .chain(std::iter::once(output))
        .map(TensorType::total_alloc_size)
        .collect()
}

pub(crate) fn no_reduction_axes(_: &OpAttrs, _: usize) -> Vec<usize> {
    vec![]
}

pub(crate) fn check_operand_count(
    kind: OpKind,
    operands: &[TensorType],
    allowed: std::ops::RangeInclusive<usize>,
    expected: &'static str,
) -> Result<(), InferError> {
    if !allowed.contains(&operands.len()) {
        return Err(InferError::OperandCount {
            kind,
            expected,
            got: operands.len(),
        });
    }
    Ok(())
}

pub(crate) fn check_back_infer_inputs(
    output: &Region,
    operand_shapes: &[Shape],
    rank: usize,
    operands: std::ops::RangeInclusive<usize>,
) -> Result<(), BackInferError> {
    if output.rank() != rank {
        return Err(BackInferError::RankMismatch {
            expected: rank,
            got: output.rank(),
        });
    }
    if !operands.contains(&operand_shapes.len()) {
        return Err(BackInferError::OperandCount {
            expected: *operands.start(),
            got: operand_shapes.len(),
        });
    }
    Ok(())
}
