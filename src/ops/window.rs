//! Windowed operations: convolutions and pooling over NCHW activations.

use super::{
    attrs::effective_kernel, check_back_infer_inputs, check_operand_count, no_reduction_axes,
    operands_and_output, AttrError, BackInferError, ConvAttrs, IllegalSplit, InferError, OpAttrs,
    OpKind, OpRules, OpView, TileInference,
};
use crate::common::{act, filter, DimSize, Shape};
use crate::region::{PadInfo, Region};
use crate::tensorspec::TensorType;

/// Output channels of hardware convolutions are processed in groups of this many.
pub const NCE_CHANNEL_ALIGNMENT: DimSize = 16;

pub(super) fn convolution_rules() -> OpRules {
    OpRules {
        infer_output: infer_conv,
        back_infer: Some(back_infer_conv),
        split_legality: Some(conv_legality),
        reduction_axes: no_reduction_axes,
        splits_reductions: false,
        buffer_sizes: operands_and_output,
    }
}

pub(super) fn group_convolution_rules() -> OpRules {
    OpRules {
        back_infer: Some(back_infer_group_conv),
        split_legality: Some(group_conv_legality),
        ..convolution_rules()
    }
}

pub(super) fn pool_rules() -> OpRules {
    OpRules {
        infer_output: infer_pool,
        back_infer: Some(back_infer_pool),
        split_legality: None,
        reduction_axes: no_reduction_axes,
        splits_reductions: false,
        buffer_sizes: operands_and_output,
    }
}

/// Output extent of a window sliding over `extent` padded by `pads`, or `None` if the
/// padded input is smaller than one window.
pub fn window_output_size(
    extent: DimSize,
    kernel: DimSize,
    stride: u32,
    dilation: u32,
    pads: (u32, u32),
) -> Option<DimSize> {
    let padded = extent.checked_add(pads.0)?.checked_add(pads.1)?;
    let window = effective_kernel(kernel, dilation)?;
    if padded < window {
        return None;
    }
    Some((padded - window) / stride + 1)
}

/// The input range read by output positions `offset..offset + size` of one spatial
/// dimension, clipped to the input, with the padding left on each side of the tile.
///
/// Fails when the tile would need more padding than the operation declares.
fn window_range(
    offset: DimSize,
    size: DimSize,
    kernel: DimSize,
    stride: u32,
    dilation: u32,
    pads: (u32, u32),
    extent: DimSize,
) -> Option<(DimSize, DimSize, u32, u32)> {
    let start = i64::from(offset) * i64::from(stride) - i64::from(pads.0);
    let end = (i64::from(offset) + i64::from(size) - 1) * i64::from(stride)
        + i64::from(effective_kernel(kernel, dilation)?)
        - i64::from(pads.0);
    let pad_before = (-start).max(0);
    let pad_after = (end - i64::from(extent)).max(0);
    if pad_before > i64::from(pads.0) || pad_after > i64::from(pads.1) {
        return None;
    }
    let clipped_start = start.max(0);
    let clipped_end = end.min(i64::from(extent));
    if clipped_end <= clipped_start {
        return None;
    }
    Some((
        DimSize::try_from(clipped_start).ok()?,
        DimSize::try_from(clipped_end - clipped_start).ok()?,
        u32::try_from(pad_before).ok()?,
        u32::try_from(pad_after).ok()?,
    ))
}

/// Sets the spatial dimensions of `input` to the window of `output`.
fn spatial_back_infer(
    output: &Region,
    input: Region,
    input_shape: &[DimSize],
    kernel: [DimSize; 2],
    strides: [u32; 2],
    dilations: [u32; 2],
    pads: PadInfo,
) -> Result<(Region, PadInfo), BackInferError> {
    let mut region = input;
    let mut tile_pads = [(0, 0); 2];
    let declared = [(pads.top, pads.bottom), (pads.left, pads.right)];
    for (i, dim) in [act::H, act::W].into_iter().enumerate() {
        let Some((start, size, before, after)) = window_range(
            output.offsets()[dim],
            output.shape()[dim],
            kernel[i],
            strides[i],
            dilations[i],
            declared[i],
            input_shape[dim],
        ) else {
            return Err(BackInferError::RegionViolation {
                operand: 0,
                region: output.clone(),
                shape: Shape::from(input_shape),
            });
        };
        region = region.with_dim(dim, start, size);
        tile_pads[i] = (before, after);
    }
    let tile_pads = PadInfo::new(tile_pads[0].0, tile_pads[0].1, tile_pads[1].0, tile_pads[1].1);
    Ok((region, tile_pads))
}

fn check_rank4(kind: OpKind, operands: &[TensorType]) -> Result<Vec<Shape>, InferError> {
    let shapes: Vec<Shape> = operands.iter().map(TensorType::shape).collect();
    if shapes.iter().any(|s| s.len() != 4) {
        return Err(InferError::Incompatible { kind, shapes });
    }
    Ok(shapes)
}

fn infer_conv(
    kind: OpKind,
    operands: &[TensorType],
    attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 2..=3, "2 or 3")?;
    let OpAttrs::Conv(conv) = attrs else {
        return Err(InferError::AttrMismatch {
            kind,
            attrs: attrs.clone(),
        });
    };
    let shapes = check_rank4(kind, operands)?;
    let (input, weights) = (&shapes[0], &shapes[1]);
    let oc = weights[filter::OC];
    let consistent = match kind {
        OpKind::Convolution => conv.groups() == 1 && input[act::C] == weights[filter::IC],
        _ => {
            input[act::C] == weights[filter::IC] * conv.groups() && oc % conv.groups() == 0
        }
    };
    let bias_ok = shapes
        .get(2)
        .map_or(true, |b| b.as_slice() == [1, oc, 1, 1]);
    let pads = conv.pads();
    let out_h = window_output_size(
        input[act::H],
        weights[filter::KY],
        conv.strides()[0],
        conv.dilations()[0],
        (pads.top, pads.bottom),
    );
    let out_w = window_output_size(
        input[act::W],
        weights[filter::KX],
        conv.strides()[1],
        conv.dilations()[1],
        (pads.left, pads.right),
    );
    let (true, true, Some(out_h), Some(out_w)) = (consistent, bias_ok, out_h, out_w) else {
        return Err(InferError::Incompatible { kind, shapes });
    };
    // A window made only of padding reads no input.
    for (pad, kernel, dilation) in [
        (pads.top.max(pads.bottom), weights[filter::KY], conv.dilations()[0]),
        (pads.left.max(pads.right), weights[filter::KX], conv.dilations()[1]),
    ] {
        let extent = effective_kernel(kernel, dilation).unwrap_or(0);
        if pad >= extent {
            let source = AttrError::PadTooLarge { pad, extent };
            return Err(InferError::Attr { kind, source });
        }
    }
    // Input quantization does not describe the output channels.
    let data = operands[0].data();
    let spec = data
        .change_dtype(data.dtype())
        .change_shape(&[input[act::N], oc, out_h, out_w])?;
    Ok(TensorType::Dense(spec))
}

fn conv_regions(
    output: &Region,
    operand_shapes: &[Shape],
    input_channels: (DimSize, DimSize),
    attrs: &OpAttrs,
) -> Result<(Vec<Region>, PadInfo, ConvAttrs), BackInferError> {
    check_back_infer_inputs(output, operand_shapes, 4, 2..=3)?;
    let OpAttrs::Conv(conv) = attrs else {
        return Err(BackInferError::AttrMismatch(attrs.clone()));
    };
    let (input_shape, weights) = (&operand_shapes[0], &operand_shapes[1]);
    let (oc_offset, oc_size) = (output.offsets()[act::C], output.shape()[act::C]);

    let input = Region::full(input_shape)
        .with_dim(act::N, output.offsets()[act::N], output.shape()[act::N])
        .with_dim(act::C, input_channels.0, input_channels.1);
    let (input, tile_pads) = spatial_back_infer(
        output,
        input,
        input_shape,
        [weights[filter::KY], weights[filter::KX]],
        conv.strides(),
        conv.dilations(),
        conv.pads(),
    )?;
    let mut regions = vec![
        input,
        Region::full(weights).with_dim(filter::OC, oc_offset, oc_size),
    ];
    if let Some(bias) = operand_shapes.get(2) {
        regions.push(Region::full(bias).with_dim(act::C, oc_offset, oc_size));
    }
    for (operand, (region, shape)) in regions.iter().zip(operand_shapes).enumerate() {
        if region.check_within(shape).is_err() {
            return Err(BackInferError::RegionViolation {
                operand,
                region: region.clone(),
                shape: shape.clone(),
            });
        }
    }
    Ok((regions, tile_pads, *conv))
}

/// Every output channel reads every input channel; filter and bias follow the output
/// channels.
fn back_infer_conv(
    output: &Region,
    operand_shapes: &[Shape],
    attrs: &OpAttrs,
) -> Result<TileInference, BackInferError> {
    let input_channels = operand_shapes
        .first()
        .and_then(|s| s.get(act::C))
        .copied()
        .unwrap_or(0);
    let (operands, pads, conv) =
        conv_regions(output, operand_shapes, (0, input_channels), attrs)?;
    Ok(TileInference {
        operands,
        pads: Some(pads),
        attrs: OpAttrs::Conv(conv.with_pads(pads)),
    })
}

/// Output channels are cut on group boundaries; the input channels of the covered groups
/// are read and the group count becomes `tile input channels / filter input channels`.
fn back_infer_group_conv(
    output: &Region,
    operand_shapes: &[Shape],
    attrs: &OpAttrs,
) -> Result<TileInference, BackInferError> {
    check_back_infer_inputs(output, operand_shapes, 4, 2..=3)?;
    let OpAttrs::Conv(conv) = attrs else {
        return Err(BackInferError::AttrMismatch(attrs.clone()));
    };
    let weights = &operand_shapes[1];
    let per_group = weights[filter::OC] / conv.groups();
    let filter_ic = weights[filter::IC];
    let (offset, size) = (output.offsets()[act::C], output.shape()[act::C]);
    if per_group == 0 || offset % per_group != 0 || size % per_group != 0 {
        return Err(BackInferError::GroupMisaligned {
            offset,
            size,
            per_group,
        });
    }
    let input_channels = (offset / per_group * filter_ic, size / per_group * filter_ic);
    let (operands, pads, _) = conv_regions(output, operand_shapes, input_channels, attrs)?;
    let groups = operands[0].shape()[act::C] / filter_ic;
    Ok(TileInference {
        operands,
        pads: Some(pads),
        attrs: OpAttrs::Conv(conv.with_pads(pads).with_groups(groups)),
    })
}

fn conv_legality(view: &OpView, dim: usize, tile: DimSize) -> Result<(), IllegalSplit> {
    if dim != act::C {
        return Ok(());
    }
    let channels = view.output.shape()[act::C];
    if channels % NCE_CHANNEL_ALIGNMENT == 0 && tile % NCE_CHANNEL_ALIGNMENT != 0 {
        return Err(IllegalSplit::ChannelAlignment {
            tile,
            alignment: NCE_CHANNEL_ALIGNMENT,
        });
    }
    Ok(())
}

fn group_conv_legality(view: &OpView, dim: usize, tile: DimSize) -> Result<(), IllegalSplit> {
    if dim != act::C {
        return Ok(());
    }
    let OpAttrs::Conv(conv) = view.op.attrs() else {
        return Ok(());
    };
    let per_group = view.output.shape()[act::C] / conv.groups();
    if per_group == 0 || tile % per_group != 0 {
        return Err(IllegalSplit::GroupAlignment { tile, per_group });
    }
    Ok(())
}

fn infer_pool(
    kind: OpKind,
    operands: &[TensorType],
    attrs: &OpAttrs,
) -> Result<TensorType, InferError> {
    check_operand_count(kind, operands, 1..=1, "1")?;
    let OpAttrs::Pool(pool) = attrs else {
        return Err(InferError::AttrMismatch {
            kind,
            attrs: attrs.clone(),
        });
    };
    let shapes = check_rank4(kind, operands)?;
    let input = &shapes[0];
    let pads = pool.pads();
    let out_h = window_output_size(
        input[act::H],
        pool.kernel()[0],
        pool.strides()[0],
        1,
        (pads.top, pads.bottom),
    );
    let out_w = window_output_size(
        input[act::W],
        pool.kernel()[1],
        pool.strides()[1],
        1,
        (pads.left, pads.right),
    );
    let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
        return Err(InferError::Incompatible { kind, shapes });
    };
    let spec = operands[0]
        .data()
        .change_shape(&[input[act::N], input[act::C], out_h, out_w])?;
    Ok(TensorType::Dense(spec))
}

/// Pooling keeps batch and channels; only the spatial window is widened.
fn back_infer_pool(
    output: &Region,
    operand_shapes: &[Shape],
    attrs: &OpAttrs,
) -> Result<TileInference, BackInferError> {
    check_back_infer_inputs(output, operand_shapes, 4, 1..=1)?;
    let OpAttrs::Pool(pool) = attrs else {
        return Err(BackInferError::AttrMismatch(attrs.clone()));
    };
    let input_shape = &operand_shapes[0];
    let input = Region::full(input_shape)
        .with_dim(act::N, output.offsets()[act::N], output.shape()[act::N])
        .with_dim(act::C, output.offsets()[act::C], output.shape()[act::C]);
    let (input, pads) = spatial_back_infer(
        output,
        input,
        input_shape,
        pool.kernel(),
        pool.strides(),
        [1, 1],
        pool.pads(),
    )?;
    if input.check_within(input_shape).is_err() {
        return Err(BackInferError::RegionViolation {
            operand: 0,
            region: input,
            shape: input_shape.clone(),
        });
    }
    Ok(TileInference {
        operands: vec![input],
        pads: Some(pads),
        attrs: OpAttrs::Pool(pool.with_pads(pads)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ops::{OpRegistry, Operation, PoolAttrs};
    use crate::shape;
    use crate::tensorspec::TensorSpec;

    fn dense(shape: Shape) -> TensorType {
        TensorType::Dense(TensorSpec::new(shape, Dtype::Float16))
    }

    fn conv3x3_pad1() -> OpAttrs {
        OpAttrs::Conv(ConvAttrs::new([1, 1], [1, 1], PadInfo::new(1, 1, 1, 1), 1).unwrap())
    }

    #[test]
    fn test_window_output_size() {
        assert_eq!(window_output_size(8, 3, 1, 1, (1, 1)), Some(8));
        assert_eq!(window_output_size(8, 3, 2, 1, (1, 1)), Some(4));
        assert_eq!(window_output_size(8, 3, 1, 2, (0, 0)), Some(4));
        assert_eq!(window_output_size(2, 3, 1, 1, (0, 0)), None);
        assert_eq!(window_output_size(4, 0, 1, 1, (0, 0)), None);
    }

    #[test]
    fn test_conv_tile_pads_come_from_clipping() {
        let shapes = [shape![1, 16, 8, 8], shape![32, 16, 3, 3]];
        // Top half of the output rows.
        let top = Region::new(shape![0, 0, 0, 0], shape![1, 32, 4, 8]);
        let t = back_infer_conv(&top, &shapes, &conv3x3_pad1()).unwrap();
        assert_eq!(t.operands[0], Region::new(shape![0, 0, 0, 0], shape![1, 16, 5, 8]));
        assert_eq!(t.pads, Some(PadInfo::new(1, 0, 1, 1)));

        let bottom = Region::new(shape![0, 0, 4, 0], shape![1, 32, 4, 8]);
        let t = back_infer_conv(&bottom, &shapes, &conv3x3_pad1()).unwrap();
        assert_eq!(t.operands[0], Region::new(shape![0, 0, 3, 0], shape![1, 16, 5, 8]));
        assert_eq!(t.pads, Some(PadInfo::new(0, 1, 1, 1)));
    }

    #[test]
    fn test_conv_filter_and_bias_follow_output_channels() {
        let shapes = [shape![1, 16, 8, 8], shape![32, 16, 3, 3], shape![1, 32, 1, 1]];
        let tile = Region::new(shape![0, 16, 0, 0], shape![1, 16, 8, 8]);
        let t = back_infer_conv(&tile, &shapes, &conv3x3_pad1()).unwrap();
        assert_eq!(t.operands[0], Region::full(&[1, 16, 8, 8]));
        assert_eq!(t.operands[1], Region::new(shape![16, 0, 0, 0], shape![16, 16, 3, 3]));
        assert_eq!(t.operands[2], Region::new(shape![0, 16, 0, 0], shape![1, 16, 1, 1]));
    }

    #[test]
    fn test_strided_dilated_window() {
        let attrs = OpAttrs::Conv(ConvAttrs::new([2, 2], [2, 2], PadInfo::default(), 1).unwrap());
        let shapes = [shape![1, 4, 11, 11], shape![4, 4, 3, 3]];
        // Output is 4x4; rows 2..4 read input rows 4..11.
        let tile = Region::new(shape![0, 0, 2, 0], shape![1, 4, 2, 4]);
        let t = back_infer_conv(&tile, &shapes, &attrs).unwrap();
        assert_eq!(t.operands[0].offsets()[act::H], 4);
        assert_eq!(t.operands[0].shape()[act::H], 7);
        assert_eq!(t.pads, Some(PadInfo::default()));
    }

    #[test]
    fn test_region_outside_padding_is_a_violation() {
        let shapes = [shape![1, 16, 8, 8], shape![32, 16, 3, 3]];
        let beyond = Region::new(shape![0, 0, 6, 0], shape![1, 32, 4, 8]);
        assert!(matches!(
            back_infer_conv(&beyond, &shapes, &conv3x3_pad1()),
            Err(BackInferError::RegionViolation { .. })
        ));
    }

    #[test]
    fn test_group_conv_recomputes_groups() {
        let attrs = OpAttrs::Conv(ConvAttrs::new([1, 1], [1, 1], PadInfo::default(), 8).unwrap());
        let shapes = [shape![1, 16, 4, 4], shape![16, 2, 1, 1]];
        let tile = Region::new(shape![0, 8, 0, 0], shape![1, 8, 4, 4]);
        let t = back_infer_group_conv(&tile, &shapes, &attrs).unwrap();
        assert_eq!(t.operands[0], Region::new(shape![0, 8, 0, 0], shape![1, 8, 4, 4]));
        assert_eq!(t.operands[1], Region::new(shape![8, 0, 0, 0], shape![8, 2, 1, 1]));
        let OpAttrs::Conv(adjusted) = t.attrs else {
            panic!("expected convolution attributes");
        };
        assert_eq!(adjusted.groups(), 4);

        let misaligned = Region::new(shape![0, 1, 0, 0], shape![1, 8, 4, 4]);
        assert!(matches!(
            back_infer_group_conv(&misaligned, &shapes, &attrs),
            Err(BackInferError::GroupMisaligned { .. })
        ));
    }

    #[test]
    fn test_conv_channel_tiles_keep_alignment() {
        let registry = OpRegistry::standard();
        let view = registry
            .view(
                "conv",
                Operation::new(OpKind::Convolution, conv3x3_pad1()).unwrap(),
                vec![dense(shape![1, 16, 8, 8]), dense(shape![32, 16, 3, 3])],
            )
            .unwrap();
        assert_eq!(view.output.shape(), shape![1, 32, 8, 8]);
        assert!(conv_legality(&view, act::C, 16).is_ok());
        assert!(conv_legality(&view, act::C, 8).is_err());
        assert!(conv_legality(&view, act::H, 3).is_ok());
    }

    #[test]
    fn test_conv_rejects_inconsistent_channels() {
        let registry = OpRegistry::standard();
        let result = registry.view(
            "conv",
            Operation::new(OpKind::Convolution, conv3x3_pad1()).unwrap(),
            vec![dense(shape![1, 16, 8, 8]), dense(shape![32, 8, 3, 3])],
        );
        assert!(matches!(result, Err(InferError::Incompatible { .. })));
    }

    #[test]
    fn test_conv_rejects_empty_kernel() {
        let registry = OpRegistry::standard();
        let result = registry.view(
            "conv",
            Operation::new(OpKind::Convolution, OpAttrs::Conv(ConvAttrs::unit())).unwrap(),
            vec![dense(shape![1, 4, 4, 4]), dense(shape![4, 4, 0, 1])],
        );
        assert!(matches!(result, Err(InferError::Incompatible { .. })));
    }

    #[test]
    fn test_conv_rejects_padding_only_windows() {
        let attrs = ConvAttrs::new([1, 1], [1, 1], PadInfo::new(2, 0, 0, 0), 1).unwrap();
        let registry = OpRegistry::standard();
        let result = registry.view(
            "conv",
            Operation::new(OpKind::Convolution, OpAttrs::Conv(attrs)).unwrap(),
            vec![dense(shape![1, 1, 8, 1]), dense(shape![1, 1, 1, 1])],
        );
        assert_eq!(
            result.err(),
            Some(InferError::Attr {
                kind: OpKind::Convolution,
                source: AttrError::PadTooLarge { pad: 2, extent: 1 },
            })
        );
    }

    #[test]
    fn test_pool_keeps_channels() {
        let attrs = OpAttrs::Pool(PoolAttrs::new([2, 2], [2, 2], PadInfo::default()).unwrap());
        let registry = OpRegistry::standard();
        let view = registry
            .view(
                "pool",
                Operation::new(OpKind::MaxPool, attrs.clone()).unwrap(),
                vec![dense(shape![1, 8, 6, 6])],
            )
            .unwrap();
        assert_eq!(view.output.shape(), shape![1, 8, 3, 3]);
        let tile = Region::new(shape![0, 4, 1, 0], shape![1, 4, 2, 3]);
        let t = back_infer_pool(&tile, &view.operand_shapes(), &attrs).unwrap();
        assert_eq!(t.operands[0], Region::new(shape![0, 4, 2, 0], shape![1, 4, 4, 6]));
    }
}
