//! Data-movement operations. `Slice` and `Concat` are what the rewriter emits to
//! extract operand tiles and reassemble a tiled result.

use super::{
    check_back_infer_inputs, check_operand_count, no_reduction_axes, operands_and_output,
    BackInferError, InferError, OpAttrs, OpKind, OpRules, TileInference,
};
use crate::common::{DimSize, Shape};
use crate::region::Region;
use crate::tensorspec::{Quant, TensorType};
use crate::tiling::is_partition;

pub(super) fn slice_rules() -> OpRules {
    OpRules {
        infer_output: infer_slice,
        back_infer: Some(back_infer_slice),
        split_legality: None,
        reduction_axes: no_reduction_axes,
        splits_reductions: false,
        buffer_sizes: operands_and_output,
    }
}

pub(super) fn concat_rules() -> OpRules {
    OpRules {
        infer_output: infer_concat,
        back_infer: None,
        ..slice_rules()
    }
}

pub(super) fn reshape_rules() -> OpRules {
    OpRules {
        infer_output: infer_reshape,
        back_infer: None,
        ..slice_rules()
    }
}

fn infer_slice(
    kind: OpKind,
    operands: &[TensorType],
    attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 1..=1, "1")?;
    let OpAttrs::Slice(region) = attrs else {
        return Err(InferError::AttrMismatch {
            kind,
            attrs: attrs.clone(),
        });
    };
    Ok(operands[0].extract_tile(region)?)
}

fn back_infer_slice(
    output: &Region,
    operand_shapes: &[Shape],
    attrs: &OpAttrs,
) -> Result<TileInference, BackInferError> {
    let OpAttrs::Slice(slice) = attrs else {
        return Err(BackInferError::AttrMismatch(attrs.clone()));
    };
    check_back_infer_inputs(output, operand_shapes, slice.rank(), 1..=1)?;
    let region = slice.compose(output);
    if region.check_within(&operand_shapes[0]).is_err() {
        return Err(BackInferError::RegionViolation {
            operand: 0,
            region,
            shape: operand_shapes[0].clone(),
        });
    }
    // A tile of a slice is itself a slice, just of a different region.
    Ok(TileInference {
        operands: vec![region.clone()],
        pads: None,
        attrs: OpAttrs::Slice(region),
    })
}

/// Inputs must exactly tile the output they are placed into.
fn infer_concat(
    kind: OpKind,
    operands: &[TensorType],
    attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 1..=usize::MAX, "at least 1")?;
    let OpAttrs::Concat { offsets } = attrs else {
        return Err(InferError::AttrMismatch {
            kind,
            attrs: attrs.clone(),
        });
    };
    let shapes: Vec<Shape> = operands.iter().map(TensorType::shape).collect();
    let rank = shapes[0].len();
    let consistent = offsets.len() == shapes.len()
        && offsets.iter().chain(&shapes).all(|s| s.len() == rank)
        && operands.iter().all(|o| o.dtype() == operands[0].dtype());
    if !consistent {
        return Err(InferError::Incompatible { kind, shapes });
    }
    let regions: Vec<Region> = offsets
        .iter()
        .zip(&shapes)
        .map(|(o, s)| Region::new(o.clone(), s.clone()))
        .collect();
    let out: Shape = (0..rank)
        .map(|d| regions.iter().map(|r| r.end(d)).max().unwrap_or(0))
        .collect();
    if !is_partition(&regions, &out) {
        return Err(InferError::Incompatible { kind, shapes });
    }
    let first = operands[0].data();
    let Some(quant) = merge_quant(operands, &regions, &out) else {
        return Err(InferError::Incompatible { kind, shapes });
    };
    let spec = first.change_dtype(first.dtype()).change_shape(&out)?;
    Ok(TensorType::Dense(match quant {
        Some(quant) => spec.with_quant(quant)?,
        None => spec,
    }))
}

/// Stitches the inputs' per-axis scales together in the order their regions cover the
/// axis. Inputs must agree on how they are quantized and on any scale they share.
fn merge_quant(
    operands: &[TensorType],
    regions: &[Region],
    out: &[DimSize],
) -> Option<Option<Quant>> {
    let first = operands[0].data().quant();
    let Some(Quant::PerAxis { axis, .. }) = first else {
        let uniform = operands.iter().all(|o| o.data().quant() == first);
        return uniform.then(|| first.cloned());
    };
    let a = usize::from(*axis);
    let size = *out.get(a)? as usize;
    let mut scales = vec![None; size];
    for (operand, region) in operands.iter().zip(regions) {
        let Some(Quant::PerAxis {
            axis: other,
            scales: s,
            zero_points: z,
        }) = operand.data().quant()
        else {
            return None;
        };
        if other != axis {
            return None;
        }
        let offset = region.offsets()[a] as usize;
        for (i, pair) in s.iter().copied().zip(z.iter().copied()).enumerate() {
            let slot = scales.get_mut(offset + i)?;
            if matches!(*slot, Some(existing) if existing != pair) {
                return None;
            }
            *slot = Some(pair);
        }
    }
    let pairs: Vec<(f64, i64)> = scales.into_iter().collect::<Option<_>>()?;
    let (scales, zero_points) = pairs.into_iter().unzip();
    Some(Some(Quant::PerAxis {
        axis: *axis,
        scales,
        zero_points,
    }))
}

fn infer_reshape(
    kind: OpKind,
    operands: &[TensorType],
    attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 1..=1, "1")?;
    let OpAttrs::Reshape { shape } = attrs else {
        return Err(InferError::AttrMismatch {
            kind,
            attrs: attrs.clone(),
        });
    };
    Ok(TensorType::Dense(operands[0].data().reshape(shape)?))
}
