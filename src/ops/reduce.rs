use super::{
    check_back_infer_inputs, check_operand_count, operands_and_output, BackInferError,
    InferError, OpAttrs, OpKind, OpRules, TileInference,
};
use crate::common::Shape;
use crate::region::Region;
use crate::tensorspec::TensorType;

pub(super) fn reduce_rules() -> OpRules {
    OpRules {
        infer_output: infer_reduce,
        back_infer: Some(back_infer_reduce),
        split_legality: None,
        reduction_axes: reduce_axes,
        splits_reductions: false,
        buffer_sizes: operands_and_output,
    }
}

pub(super) fn softmax_rules() -> OpRules {
    OpRules {
        infer_output: infer_softmax,
        back_infer: Some(back_infer_softmax),
        split_legality: None,
        reduction_axes: softmax_axis,
        splits_reductions: false,
        buffer_sizes: operands_and_output,
    }
}

fn infer_reduce(
    kind: OpKind,
    operands: &[TensorType],
    attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 1..=1, "1")?;
    let OpAttrs::Reduce(reduce) = attrs else {
        return Err(InferError::AttrMismatch {
            kind,
            attrs: attrs.clone(),
        });
    };
    let input = operands[0].shape();
    if reduce.axes().iter().any(|&a| usize::from(a) >= input.len()) {
        return Err(InferError::Incompatible {
            kind,
            shapes: vec![input],
        });
    }
    let out: Shape = input
        .iter()
        .enumerate()
        .filter_map(|(d, &size)| match (reduce.reduces(d), reduce.keep_dims()) {
            (false, _) => Some(size),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    let data = operands[0].data();
    Ok(TensorType::Dense(
        data.change_dtype(data.dtype()).change_shape(&out)?,
    ))
}

/// Reduced axes are read in full; every other input axis follows its output axis.
fn back_infer_reduce(
    output: &Region,
    operand_shapes: &[Shape],
    attrs: &OpAttrs,
) -> Result<TileInference, BackInferError> {
    let OpAttrs::Reduce(reduce) = attrs else {
        return Err(BackInferError::AttrMismatch(attrs.clone()));
    };
    let input_shape = operand_shapes.first().cloned().unwrap_or_default();
    let out_rank = if reduce.keep_dims() {
        input_shape.len()
    } else {
        input_shape.len().saturating_sub(reduce.axes().len())
    };
    check_back_infer_inputs(output, operand_shapes, out_rank, 1..=1)?;

    let mut region = Region::full(&input_shape);
    let mut out_dim = 0;
    for dim in 0..input_shape.len() {
        if reduce.reduces(dim) {
            if reduce.keep_dims() {
                out_dim += 1;
            }
            continue;
        }
        region = region.with_dim(dim, output.offsets()[out_dim], output.shape()[out_dim]);
        out_dim += 1;
    }
    Ok(TileInference {
        operands: vec![region],
        pads: None,
        attrs: attrs.clone(),
    })
}

/// With `keep_dims` the reduced axes survive in the output as size-1 axes.
fn reduce_axes(attrs: &OpAttrs, _rank: usize) -> Vec<usize> {
    match attrs {
        OpAttrs::Reduce(r) if r.keep_dims() => r.axes().iter().map(|&a| usize::from(a)).collect(),
        _ => vec![],
    }
}

fn infer_softmax(
    kind: OpKind,
    operands: &[TensorType],
    attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 1..=1, "1")?;
    let shape = operands[0].shape();
    match attrs {
        OpAttrs::Softmax { axis } if usize::from(*axis) < shape.len() => {}
        _ => {
            return Err(InferError::AttrMismatch {
                kind,
                attrs: attrs.clone(),
            })
        }
    }
    Ok(TensorType::Dense(operands[0].data().change_shape(&shape)?))
}

fn back_infer_softmax(
    output: &Region,
    operand_shapes: &[Shape],
    attrs: &OpAttrs,
) -> Result<TileInference, BackInferError> {
    check_back_infer_inputs(output, operand_shapes, output.rank(), 1..=1)?;
    Ok(TileInference {
        operands: vec![output.clone()],
        pads: None,
        attrs: attrs.clone(),
    })
}

fn softmax_axis(attrs: &OpAttrs, _rank: usize) -> Vec<usize> {
    match attrs {
        OpAttrs::Softmax { axis } => vec![usize::from(*axis)],
        _ => vec![],
    }
}
