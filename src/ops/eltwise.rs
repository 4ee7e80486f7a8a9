use super::{
    check_back_infer_inputs, check_operand_count, no_reduction_axes, operands_and_output,
    BackInferError, InferError, OpAttrs, OpKind, OpRules, TileInference,
};
use crate::common::{DimSize, Dtype, Shape};
use crate::region::Region;
use crate::tensorspec::TensorType;

pub(super) fn binary_rules() -> OpRules {
    OpRules {
        infer_output: infer_binary,
        back_infer: Some(back_infer),
        split_legality: None,
        reduction_axes: no_reduction_axes,
        splits_reductions: false,
        buffer_sizes: operands_and_output,
    }
}

pub(super) fn unary_rules() -> OpRules {
    OpRules {
        infer_output: infer_unary,
        ..binary_rules()
    }
}

/// Numpy-style broadcast of equal-rank shapes: each dimension must match or be 1.
pub fn broadcast_shape(shapes: &[Shape]) -> Option<Shape> {
    let first = shapes.first()?;
    if shapes.iter().any(|s| s.len() != first.len()) {
        return None;
    }
    let mut out = first.clone();
    for shape in &shapes[1..] {
        for (o, &d) in out.iter_mut().zip(shape) {
            if *o == 1 {
                *o = d;
            } else if d != 1 && d != *o {
                return None;
            }
        }
    }
    Some(out)
}

fn infer_binary(
    kind: OpKind,
    operands: &[TensorType],
    _attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 2..=2, "2")?;
    let shapes: Vec<Shape> = operands.iter().map(TensorType::shape).collect();
    let out = broadcast_shape(&shapes).ok_or(InferError::Incompatible { kind, shapes })?;
    let dtype = match kind {
        OpKind::NotEqual => Dtype::Bool,
        _ => operands[0].dtype(),
    };
    let spec = operands[0].data().change_dtype(dtype).change_shape(&out)?;
    Ok(TensorType::Dense(spec))
}

fn infer_unary(
    kind: OpKind,
    operands: &[TensorType],
    _attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 1..=1, "1")?;
    let spec = operands[0].data().change_shape(&operands[0].shape())?;
    Ok(TensorType::Dense(spec))
}

/// Each operand reads the output region, except along broadcast dimensions where it
/// reads its single element.
fn back_infer(
    output: &Region,
    operand_shapes: &[Shape],
    attrs: &OpAttrs,
) -> Result<TileInference, BackInferError> {
    check_back_infer_inputs(output, operand_shapes, output.rank(), 1..=usize::MAX)?;
    let operands = operand_shapes
        .iter()
        .map(|shape| broadcast_region(output, shape))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TileInference {
        operands,
        pads: None,
        attrs: attrs.clone(),
    })
}

fn broadcast_region(output: &Region, shape: &[DimSize]) -> Result<Region, BackInferError> {
    if shape.len() != output.rank() {
        return Err(BackInferError::RankMismatch {
            expected: shape.len(),
            got: output.rank(),
        });
    }
    let mut region = output.clone();
    for (dim, &size) in shape.iter().enumerate() {
        if size == 1 {
            region = region.with_dim(dim, 0, 1);
        }
    }
    Ok(region)
}
