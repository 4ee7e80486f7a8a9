//! A reference evaluator for graphs, used to check that tiling preserves results
//! bit for bit.
#![cfg(feature = "verification")]

use ndarray::prelude::*;
use ndarray::{Slice, Zip};
use std::collections::HashMap;

use crate::common::DimSize;
use crate::graph::{Graph, GraphError, ValueDef, ValueId};
use crate::ops::{ConvAttrs, OpAttrs, OpKind, Operation, PoolAttrs, ReduceAttrs};
use crate::region::Region;

pub type Tensor = ArrayD<f32>;

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    #[error("No data bound to {0}")]
    Unbound(ValueId),
    #[error("{loc}: {source}")]
    Shape {
        loc: String,
        source: ndarray::ShapeError,
    },
    #[error("{loc}: operands do not fit {op}")]
    Malformed { loc: String, op: Operation },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Evaluates every live node of `graph` and returns its outputs.
pub fn evaluate(
    graph: &Graph,
    inputs: &HashMap<ValueId, Tensor>,
) -> Result<Vec<Tensor>, EvalError> {
    let mut env = inputs.clone();
    for id in graph.topo_order() {
        let node = graph.node(id)?;
        let args = node
            .operands
            .iter()
            .map(|v| env.get(v).ok_or(EvalError::Unbound(*v)))
            .collect::<Result<Vec<_>, _>>()?;
        let out = eval_op(&node.loc, &node.op, &args)?;
        env.insert(node.result, out);
    }
    graph
        .outputs()
        .iter()
        .map(|v| env.get(v).cloned().ok_or(EvalError::Unbound(*v)))
        .collect()
}

/// Deterministic data for every input and constant of `graph`.
pub fn sample_inputs(graph: &Graph) -> HashMap<ValueId, Tensor> {
    graph
        .values()
        .filter(|(_, v)| matches!(v.def, ValueDef::Input | ValueDef::Constant))
        .enumerate()
        .map(|(seed, (id, v))| {
            let shape = to_usize(&v.ty.shape());
            let len = shape.iter().product();
            let data = cycle_values(seed).take(len).collect();
            // The length matches the shape by construction.
            let tensor = Tensor::from_shape_vec(IxDyn(&shape), data)
                .unwrap_or_else(|_| Tensor::zeros(IxDyn(&shape)));
            (id, tensor)
        })
        .collect()
}

/// Whether `before` and `after` compute bit-identical outputs from the same inputs.
pub fn outputs_match(before: &Graph, after: &Graph) -> Result<bool, EvalError> {
    let inputs = sample_inputs(before);
    let expected = evaluate(before, &inputs)?;
    let got = evaluate(after, &inputs)?;
    let matches = expected.len() == got.len()
        && expected.iter().zip(&got).all(|(a, b)| {
            a.shape() == b.shape() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
        });
    if matches {
        log::debug!("tiled graph matches its original");
    } else {
        log::debug!("tiled graph diverges from its original");
    }
    Ok(matches)
}

/// Small quarter-integers with a period of 17, so products and sums stay exact for
/// moderately sized operations.
fn cycle_values(seed: usize) -> impl Iterator<Item = f32> {
    let mut i = seed * 5;
    std::iter::from_fn(move || {
        let v = (i % 17) as f32 - 8.0;
        i += 7;
        Some(v * 0.25)
    })
}

fn to_usize(shape: &[DimSize]) -> Vec<usize> {
    shape.iter().map(|&d| d as usize).collect()
}

fn eval_op(loc: &str, op: &Operation, args: &[&Tensor]) -> Result<Tensor, EvalError> {
    let malformed = || EvalError::Malformed {
        loc: loc.to_owned(),
        op: op.clone(),
    };
    let shape_err = |source| EvalError::Shape {
        loc: loc.to_owned(),
        source,
    };
    match (op.kind(), op.attrs()) {
        (OpKind::Add, _) => binary(args, |a, b| a + b).ok_or_else(malformed),
        (OpKind::Multiply, _) => binary(args, |a, b| a * b).ok_or_else(malformed),
        (OpKind::NotEqual, _) => {
            binary(args, |a, b| if a != b { 1.0 } else { 0.0 }).ok_or_else(malformed)
        }
        (OpKind::Floor, _) => Ok(args[0].mapv(f32::floor)),
        (OpKind::Selu, _) => Ok(args[0].mapv(selu)),
        (OpKind::Convolution | OpKind::GroupConvolution, OpAttrs::Conv(conv)) => {
            convolution(args, conv).map_err(shape_err)
        }
        (OpKind::MaxPool | OpKind::AvgPool, OpAttrs::Pool(pool)) => {
            pooling(args[0], pool, op.kind() == OpKind::MaxPool).map_err(shape_err)
        }
        (OpKind::ReduceL2, OpAttrs::Reduce(reduce)) => Ok(reduce_l2(args[0], reduce)),
        (OpKind::SoftMax, OpAttrs::Softmax { axis }) => Ok(softmax(args[0], usize::from(*axis))),
        (OpKind::Slice, OpAttrs::Slice(region)) => {
            let mut view = args[0].view();
            narrow_to(&mut view, region);
            Ok(view.to_owned())
        }
        (OpKind::Concat, OpAttrs::Concat { offsets }) => {
            let rank = args.first().map_or(0, |a| a.ndim());
            let out: Vec<usize> = (0..rank)
                .map(|d| {
                    args.iter()
                        .zip(offsets)
                        .map(|(a, o)| o[d] as usize + a.shape()[d])
                        .max()
                        .unwrap_or(0)
                })
                .collect();
            let mut result = Tensor::zeros(IxDyn(&out));
            for (part, offset) in args.iter().zip(offsets) {
                let mut view = result.view_mut();
                for d in 0..rank {
                    let start = offset[d] as usize;
                    view.slice_axis_inplace(Axis(d), Slice::from(start..start + part.shape()[d]));
                }
                view.assign(*part);
            }
            Ok(result)
        }
        (OpKind::AffineReshape, OpAttrs::Reshape { shape }) => args[0]
            .to_owned()
            .into_shape(IxDyn(&to_usize(shape)))
            .map_err(shape_err),
        _ => Err(malformed()),
    }
}

fn narrow_to(view: &mut ArrayViewD<'_, f32>, region: &Region) {
    for d in 0..region.rank() {
        let start = region.offsets()[d] as usize;
        let end = start + region.shape()[d] as usize;
        view.slice_axis_inplace(Axis(d), Slice::from(start..end));
    }
}

fn binary(args: &[&Tensor], f: impl Fn(f32, f32) -> f32) -> Option<Tensor> {
    let [a, b] = args else {
        return None;
    };
    let shape: Vec<usize> = a
        .shape()
        .iter()
        .zip(b.shape())
        .map(|(&x, &y)| x.max(y))
        .collect();
    let a = a.broadcast(IxDyn(&shape))?;
    let b = b.broadcast(IxDyn(&shape))?;
    Some(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)))
}

fn selu(x: f32) -> f32 {
    const ALPHA: f32 = 1.673_263_2;
    const LAMBDA: f32 = 1.050_701;
    if x > 0.0 {
        LAMBDA * x
    } else {
        LAMBDA * ALPHA * (x.exp() - 1.0)
    }
}

/// Input position read by output position `o` at kernel offset `k`, if not padding.
fn source_index(
    o: usize,
    k: usize,
    stride: u32,
    dilation: u32,
    pad: u32,
    extent: usize,
) -> Option<usize> {
    let pos = (o * stride as usize + k * dilation as usize).checked_sub(pad as usize)?;
    (pos < extent).then_some(pos)
}

fn convolution(args: &[&Tensor], conv: &ConvAttrs) -> Result<Tensor, ndarray::ShapeError> {
    let input = args[0].view().into_dimensionality::<Ix4>()?;
    let weights = args[1].view().into_dimensionality::<Ix4>()?;
    let bias = args.get(2).map(|b| b.view().into_dimensionality::<Ix4>()).transpose()?;
    let (n, _, h, w) = input.dim();
    let (oc, ic_per_group, ky, kx) = weights.dim();
    let per_group = oc / conv.groups() as usize;
    let [sy, sx] = conv.strides();
    let [dy, dx] = conv.dilations();
    let pads = conv.pads();
    let window_h = dy as usize * (ky - 1) + 1;
    let window_w = dx as usize * (kx - 1) + 1;
    let out_h = (h + (pads.top + pads.bottom) as usize - window_h) / sy as usize + 1;
    let out_w = (w + (pads.left + pads.right) as usize - window_w) / sx as usize + 1;

    let mut out = Array4::<f32>::zeros((n, oc, out_h, out_w));
    for ((b, o, y, x), value) in out.indexed_iter_mut() {
        let group = o / per_group;
        let mut acc = bias.as_ref().map_or(0.0, |bias| bias[[0, o, 0, 0]]);
        for c in 0..ic_per_group {
            for i in 0..ky {
                let Some(iy) = source_index(y, i, sy, dy, pads.top, h) else {
                    continue;
                };
                for j in 0..kx {
                    let Some(ix) = source_index(x, j, sx, dx, pads.left, w) else {
                        continue;
                    };
                    acc += input[[b, group * ic_per_group + c, iy, ix]] * weights[[o, c, i, j]];
                }
            }
        }
        *value = acc;
    }
    Ok(out.into_dyn())
}

/// Padding never wins a max and counts towards an average's divisor.
fn pooling(input: &Tensor, pool: &PoolAttrs, max: bool) -> Result<Tensor, ndarray::ShapeError> {
    let input = input.view().into_dimensionality::<Ix4>()?;
    let (n, c, h, w) = input.dim();
    let [ky, kx] = pool.kernel().map(|k| k as usize);
    let [sy, sx] = pool.strides();
    let pads = pool.pads();
    let out_h = (h + (pads.top + pads.bottom) as usize - ky) / sy as usize + 1;
    let out_w = (w + (pads.left + pads.right) as usize - kx) / sx as usize + 1;

    let mut out = Array4::<f32>::zeros((n, c, out_h, out_w));
    for ((b, ch, y, x), value) in out.indexed_iter_mut() {
        let mut acc = if max { f32::NEG_INFINITY } else { 0.0 };
        for i in 0..ky {
            let Some(iy) = source_index(y, i, sy, 1, pads.top, h) else {
                continue;
            };
            for j in 0..kx {
                let Some(ix) = source_index(x, j, sx, 1, pads.left, w) else {
                    continue;
                };
                let v = input[[b, ch, iy, ix]];
                acc = if max { acc.max(v) } else { acc + v };
            }
        }
        *value = if max { acc } else { acc / (ky * kx) as f32 };
    }
    Ok(out.into_dyn())
}

/// Sums squares over the reduced axes in row-major order.
fn reduce_l2(input: &Tensor, reduce: &ReduceAttrs) -> Tensor {
    let rank = input.ndim();
    let kept: Vec<usize> = (0..rank).filter(|&d| !reduce.reduces(d)).collect();
    let reduced: Vec<usize> = (0..rank).filter(|&d| reduce.reduces(d)).collect();
    let out_shape: Vec<usize> = (0..rank)
        .filter_map(|d| match (reduce.reduces(d), reduce.keep_dims()) {
            (false, _) => Some(input.shape()[d]),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    let kept_extents: Vec<usize> = kept.iter().map(|&d| input.shape()[d]).collect();
    let reduced_extents: Vec<usize> = reduced.iter().map(|&d| input.shape()[d]).collect();

    let mut values = Vec::with_capacity(kept_extents.iter().product());
    let mut index = vec![0; rank];
    for outer in ndarray::indices(IxDyn(&kept_extents)) {
        for (&d, &i) in kept.iter().zip(outer.slice()) {
            index[d] = i;
        }
        let mut acc = 0.0f32;
        for inner in ndarray::indices(IxDyn(&reduced_extents)) {
            for (&d, &i) in reduced.iter().zip(inner.slice()) {
                index[d] = i;
            }
            let v = input[IxDyn(&index)];
            acc += v * v;
        }
        values.push(acc.sqrt());
    }
    // Row-major iteration over kept axes matches the output layout.
    Tensor::from_shape_vec(IxDyn(&out_shape), values)
        .unwrap_or_else(|_| Tensor::zeros(IxDyn(&out_shape)))
}

fn softmax(input: &Tensor, axis: usize) -> Tensor {
    let mut out = input.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let mut sum = 0.0f32;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Dtype, Shape};
    use crate::config::CompilerConfig;
    use crate::memorylimits::MemoryBudget;
    use crate::ops::OpRegistry;
    use crate::region::PadInfo;
    use crate::rewrite::TilingPass;
    use crate::shape;
    use crate::tensorspec::{TensorSpec, TensorType};
    use proptest::prelude::*;

    fn dense(shape: Shape) -> TensorType {
        TensorType::Dense(TensorSpec::new(shape, Dtype::Float32))
    }

    /// Tiles `graph` against `capacity` bytes and checks it still computes the same.
    fn assert_round_trip(graph: Graph, capacity: u64) -> usize {
        let registry = OpRegistry::standard();
        let config = CompilerConfig {
            budget: MemoryBudget::new(capacity, 1),
            enable_prefetch: false,
            ..CompilerConfig::default()
        };
        let mut tiled = graph.clone();
        let stats = TilingPass::new(&registry, &config)
            .run(&mut tiled, &mut vec![])
            .unwrap();
        assert!(outputs_match(&graph, &tiled).unwrap());
        stats.tiled
    }

    fn single_op(kind: OpKind, attrs: OpAttrs, operands: Vec<(Shape, bool)>) -> Graph {
        let registry = OpRegistry::standard();
        let mut graph = Graph::new();
        let values = operands
            .into_iter()
            .enumerate()
            .map(|(i, (shape, constant))| {
                let name = format!("arg{i}");
                if constant {
                    graph.add_constant(&name, dense(shape))
                } else {
                    graph.add_input(&name, dense(shape))
                }
            })
            .collect();
        let op = Operation::new(kind, attrs).unwrap();
        let node = graph.add_node(&registry, "op", op, values).unwrap();
        graph.mark_output(graph.result(node).unwrap()).unwrap();
        graph
    }

    #[test]
    fn test_padded_strided_conv_round_trips() {
        let conv = ConvAttrs::new([2, 1], [1, 2], PadInfo::new(1, 2, 1, 1), 1).unwrap();
        let attrs = OpAttrs::Conv(conv);
        let graph = single_op(
            OpKind::Convolution,
            attrs,
            vec![
                (shape![1, 4, 13, 9], false),
                (shape![16, 4, 3, 3], true),
                (shape![1, 16, 1, 1], true),
            ],
        );
        assert_eq!(assert_round_trip(graph, 4096), 1);
    }

    #[test]
    fn test_group_conv_round_trips() {
        let conv = ConvAttrs::new([1, 1], [1, 1], PadInfo::new(1, 1, 1, 1), 4).unwrap();
        let attrs = OpAttrs::Conv(conv);
        let graph = single_op(
            OpKind::GroupConvolution,
            attrs,
            vec![(shape![1, 8, 6, 6], false), (shape![16, 2, 3, 3], true)],
        );
        assert_eq!(assert_round_trip(graph, 2048), 1);
    }

    #[test]
    fn test_pools_round_trip() {
        for kind in [OpKind::MaxPool, OpKind::AvgPool] {
            let pool = PoolAttrs::new([3, 3], [2, 2], PadInfo::new(1, 1, 1, 1)).unwrap();
            let attrs = OpAttrs::Pool(pool);
            let graph = single_op(kind, attrs, vec![(shape![1, 4, 16, 16], false)]);
            assert_eq!(assert_round_trip(graph, 2048), 1);
        }
    }

    #[test]
    fn test_reduce_and_softmax_round_trip() {
        let attrs = OpAttrs::Reduce(ReduceAttrs::new(&[1], false).unwrap());
        let graph = single_op(OpKind::ReduceL2, attrs, vec![(shape![2, 8, 8, 4], false)]);
        assert_eq!(assert_round_trip(graph, 1024), 1);

        let graph = single_op(
            OpKind::SoftMax,
            OpAttrs::Softmax { axis: 1 },
            vec![(shape![1, 8, 8, 4], false)],
        );
        assert_eq!(assert_round_trip(graph, 1024), 1);
    }

    #[test]
    fn test_reference_conv_matches_hand_computation() {
        let input = Tensor::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let weights = Tensor::from_elem(IxDyn(&[1, 1, 2, 2]), 1.0);
        let conv = ConvAttrs::new([1, 1], [1, 1], PadInfo::new(0, 1, 0, 1), 1).unwrap();
        let out = convolution(&[&input, &weights], &conv).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![10.0, 6.0, 7.0, 4.0]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_broadcast_eltwise_round_trips(
            h in 1u32..12,
            w in 1u32..12,
            kind in prop::sample::select(vec![OpKind::Add, OpKind::Multiply, OpKind::NotEqual]),
            capacity in 64u64..1024,
        ) {
            let graph = single_op(
                kind,
                OpAttrs::None,
                vec![(shape![1, 2, h, w], false), (shape![1, 2, 1, w], false)],
            );
            let registry = OpRegistry::standard();
            let config = CompilerConfig {
                budget: MemoryBudget::new(capacity, 1),
                enable_prefetch: false,
                ..CompilerConfig::default()
            };
            let mut tiled = graph.clone();
            let result = TilingPass::new(&registry, &config).run(&mut tiled, &mut vec![]);
            prop_assert!(result.is_ok());
            prop_assert!(outputs_match(&graph, &tiled).unwrap());
        }

        #[test]
        fn test_conv_chain_round_trips(h in 3u32..14, capacity in 1024u64..8192) {
            let registry = OpRegistry::standard();
            let mut graph = Graph::new();
            let x = graph.add_input("x", dense(shape![1, 4, h, 6]));
            let w = graph.add_constant("w", dense(shape![16, 4, 3, 3]));
            let attrs = OpAttrs::Conv(
                ConvAttrs::new([1, 1], [1, 1], PadInfo::new(1, 1, 1, 1), 1).unwrap()
            );
            let conv = graph
                .add_node(
                    &registry,
                    "conv",
                    Operation::new(OpKind::Convolution, attrs).unwrap(),
                    vec![x, w],
                )
                .unwrap();
            let y = graph.result(conv).unwrap();
            let selu = graph
                .add_node(&registry, "selu", Operation::simple(OpKind::Selu).unwrap(), vec![y])
                .unwrap();
            graph.mark_output(graph.result(selu).unwrap()).unwrap();

            let config = CompilerConfig {
                budget: MemoryBudget::new(capacity, 1),
                enable_prefetch: false,
                ..CompilerConfig::default()
            };
            let mut tiled = graph.clone();
            let result = TilingPass::new(&registry, &config).run(&mut tiled, &mut vec![]);
            prop_assert!(result.is_ok());
            prop_assert!(outputs_match(&graph, &tiled).unwrap());
        }
    }
}
