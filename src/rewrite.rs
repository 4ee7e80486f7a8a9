//! Substitutes tiled sub-graphs for operations and drives the search over whole graphs.

use crate::common::Shape;
use crate::config::CompilerConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::graph::{Graph, GraphError, NodeId, ValueId};
use crate::ops::{InferError, OpAttrs, OpKind, OpRegistry, Operation};
use crate::region::Region;
use crate::search::{Planner, TilingError};
use crate::tiling::{TilingMode, TilingPlan};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The nodes which replaced a tiled operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub slices: Vec<NodeId>,
    pub tiles: Vec<NodeId>,
    pub concat: NodeId,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RewriteError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("{loc}: tile attributes rejected: {source}")]
    Attrs { loc: String, source: InferError },
    #[error("{loc}: tile produces {got:?}, its plan expects {expected:?}")]
    TileShapeMismatch {
        loc: String,
        expected: Shape,
        got: Shape,
    },
    #[error("{loc}: plan has {plan} operand regions, the operation {op}")]
    OperandCount { loc: String, plan: usize, op: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("{loc} cannot be tiled and fallback is disabled: {source}")]
    NoFallback { loc: String, source: TilingError },
    #[error(transparent)]
    Tiling(TilingError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
}

/// Replaces `node` with one clone per tile of `plan`.
///
/// Operands a tile reads in part are extracted by `Slice` nodes (shared between tiles
/// reading the same region); whole operands are wired directly. The clones' results
/// are reassembled by a `Concat` node which takes over every use of the old result,
/// and the old node is killed. Single-tile plans leave the graph untouched.
pub fn rewrite(
    graph: &mut Graph,
    node: NodeId,
    plan: &TilingPlan,
    registry: &OpRegistry,
    sink: &mut dyn DiagnosticSink,
) -> Result<Option<Rewritten>, RewriteError> {
    if plan.is_single() {
        return Ok(None);
    }
    let original = graph.node(node)?.clone();
    let loc = original.loc.as_str();

    let mut slices: HashMap<(usize, Region), ValueId> = HashMap::new();
    let mut rewritten = Rewritten {
        slices: vec![],
        tiles: vec![],
        concat: node,
    };
    let mut tile_results = Vec::with_capacity(plan.len());
    for (t, tile) in plan.tiles.iter().enumerate() {
        if tile.operands.len() != original.operands.len() {
            return Err(RewriteError::OperandCount {
                loc: loc.to_owned(),
                plan: tile.operands.len(),
                op: original.operands.len(),
            });
        }
        let mut operands = Vec::with_capacity(tile.operands.len());
        for (i, (&value, region)) in original.operands.iter().zip(&tile.operands).enumerate() {
            if region.is_full(&graph.value(value)?.ty.shape()) {
                operands.push(value);
                continue;
            }
            if let Some(&sliced) = slices.get(&(i, region.clone())) {
                operands.push(sliced);
                continue;
            }
            let slice = graph.add_node(
                registry,
                &format!("{loc}/tile{t}/operand{i}"),
                slice_op(loc, region.clone())?,
                vec![value],
            )?;
            let sliced = graph.result(slice)?;
            slices.insert((i, region.clone()), sliced);
            rewritten.slices.push(slice);
            operands.push(sliced);
        }

        let op = original
            .op
            .with_attrs(tile.attrs.clone())
            .map_err(|source| RewriteError::Attrs {
                loc: loc.to_owned(),
                source,
            })?;
        let clone = graph.add_node(registry, &format!("{loc}/tile{t}"), op, operands)?;
        let result = graph.result(clone)?;
        let got = graph.value(result)?.ty.shape();
        if got.as_slice() != tile.output.shape() {
            return Err(RewriteError::TileShapeMismatch {
                loc: format!("{loc}/tile{t}"),
                expected: tile.output.shape().into(),
                got,
            });
        }
        rewritten.tiles.push(clone);
        tile_results.push(result);
    }

    let offsets: Vec<Shape> = plan
        .output_regions()
        .map(|r| Shape::from(r.offsets()))
        .collect();
    let concat = graph.add_node(
        registry,
        &format!("{loc}/concat"),
        Operation::new(OpKind::Concat, OpAttrs::Concat { offsets }).map_err(|source| {
            RewriteError::Attrs {
                loc: loc.to_owned(),
                source,
            }
        })?,
        tile_results,
    )?;
    graph.replace_all_uses(original.result, graph.result(concat)?)?;
    graph.kill(node)?;
    rewritten.concat = concat;
    sink.note(
        loc,
        &format!(
            "tiled into {} tiles with {} operand slices",
            rewritten.tiles.len(),
            rewritten.slices.len()
        ),
    );
    Ok(Some(rewritten))
}

fn slice_op(loc: &str, region: Region) -> Result<Operation, RewriteError> {
    Operation::new(OpKind::Slice, OpAttrs::Slice(region)).map_err(|source| RewriteError::Attrs {
        loc: loc.to_owned(),
        source,
    })
}

/// Counts of what one [TilingPass::run] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PassStats {
    pub visited: usize,
    pub tiled: usize,
    pub tiles: usize,
    pub fallbacks: usize,
    pub prefetch_retries: usize,
    pub swept: usize,
}

/// Plans and rewrites every operation of a graph, one at a time in dependency order.
pub struct TilingPass<'a> {
    pub registry: &'a OpRegistry,
    pub config: &'a CompilerConfig,
}

impl<'a> TilingPass<'a> {
    pub fn new(registry: &'a OpRegistry, config: &'a CompilerConfig) -> Self {
        TilingPass { registry, config }
    }

    /// Tiles `graph` in place.
    ///
    /// The worklist is the topological order at entry; nodes created by rewriting are
    /// not revisited. Recoverable planning failures leave the operation untiled when
    /// fallback is allowed. Region violations always abort.
    pub fn run(
        &self,
        graph: &mut Graph,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<PassStats, CompileError> {
        let planner = Planner {
            registry: self.registry,
            budget: self.config.budget,
            max_split_factor: self.config.max_split_factor,
        };
        let order = graph.topo_order();
        let mut stats = PassStats::default();
        for (idx, &node) in order.iter().enumerate() {
            stats.visited += 1;
            let view = graph.op_view(node).map_err(RewriteError::from)?;
            let mode = self.select_mode(graph, node, order.get(idx + 1).copied())?;

            let mut result = planner.plan(&view, mode, sink);
            if matches!(mode, TilingMode::Prefetch { .. }) {
                if let Err(err) = &result {
                    if err.is_recoverable() {
                        let note = format!("prefetch planning failed ({err}); retrying isolated");
                        sink.note(&view.loc, &note);
                        stats.prefetch_retries += 1;
                        result = planner.plan(&view, TilingMode::Isolated, sink);
                    }
                }
            }
            let plan = match result {
                Ok(plan) => plan,
                Err(err) if !err.is_recoverable() => return Err(CompileError::Tiling(err)),
                Err(err) if self.config.allow_fallback => {
                    sink.warn(&view.loc, &format!("left untiled: {err}"));
                    stats.fallbacks += 1;
                    continue;
                }
                Err(err) => {
                    sink.error(&view.loc, &err.to_string());
                    return Err(CompileError::NoFallback {
                        loc: view.loc.clone(),
                        source: err,
                    });
                }
            };
            if let Some(rewritten) = rewrite(graph, node, &plan, self.registry, sink)? {
                stats.tiled += 1;
                stats.tiles += rewritten.tiles.len();
            }
        }
        stats.swept = graph.sweep();
        log::info!(
            "tiled {} of {} operations into {} tiles ({} left untiled)",
            stats.tiled,
            stats.visited,
            stats.tiles,
            stats.fallbacks
        );
        Ok(stats)
    }

    /// Runs the pass over independent graphs in parallel. Each graph collects its own
    /// diagnostics.
    pub fn run_all(
        &self,
        graphs: &mut [Graph],
    ) -> Vec<(Result<PassStats, CompileError>, Vec<Diagnostic>)> {
        graphs
            .par_iter_mut()
            .map(|graph| {
                let mut diagnostics = vec![];
                let result = self.run(graph, &mut diagnostics);
                (result, diagnostics)
            })
            .collect()
    }

    /// Large constants select [TilingMode::LargeConstant]; otherwise, with prefetching
    /// enabled and a successor in the worklist, [TilingMode::Prefetch] reserves room for
    /// the successor's other inputs.
    fn select_mode(
        &self,
        graph: &Graph,
        node: NodeId,
        next: Option<NodeId>,
    ) -> Result<TilingMode, CompileError> {
        let view = graph.op_view(node).map_err(RewriteError::from)?;
        let threshold = self.config.large_constant_threshold();
        let has_large_constant = view
            .operands
            .iter()
            .zip(&view.constant)
            .any(|(t, &c)| c && t.total_alloc_size() > threshold);
        if has_large_constant {
            return Ok(TilingMode::LargeConstant);
        }
        let Some(next) = next.filter(|_| self.config.enable_prefetch) else {
            return Ok(TilingMode::Isolated);
        };
        let result = graph.result(node).map_err(RewriteError::from)?;
        let mut next_input_bytes = 0;
        for &operand in &graph.node(next).map_err(RewriteError::from)?.operands {
            if operand != result {
                next_input_bytes += graph
                    .value(operand)
                    .map_err(RewriteError::from)?
                    .ty
                    .total_alloc_size();
            }
        }
        if next_input_bytes == 0 {
            return Ok(TilingMode::Isolated);
        }
        Ok(TilingMode::Prefetch { next_input_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::diagnostics::Severity;
    use crate::graph::ValueDef;
    use crate::memorylimits::MemoryBudget;
    use crate::ops::{ConvAttrs, OpAttrs};
    use crate::region::PadInfo;
    use crate::shape;
    use crate::sparse::SparseTensor;
    use crate::tensorspec::{Quant, TensorSpec, TensorType};

    fn dense(shape: Shape, dtype: Dtype) -> TensorType {
        TensorType::Dense(TensorSpec::new(shape, dtype))
    }

    fn config(capacity: u64) -> CompilerConfig {
        CompilerConfig {
            budget: MemoryBudget::new(capacity, 1),
            enable_prefetch: false,
            ..CompilerConfig::default()
        }
    }

    /// input -> conv(3x3, pad 1) -> floor -> output
    fn conv_graph(h: u32) -> (Graph, NodeId, NodeId) {
        let registry = OpRegistry::standard();
        let mut graph = Graph::new();
        let x = graph.add_input("x", dense(shape![1, 16, h, 8], Dtype::Uint8));
        let w = graph.add_constant("w", dense(shape![16, 16, 3, 3], Dtype::Uint8));
        let conv = ConvAttrs::new([1, 1], [1, 1], PadInfo::new(1, 1, 1, 1), 1).unwrap();
        let attrs = OpAttrs::Conv(conv);
        let conv = graph
            .add_node(
                &registry,
                "conv",
                Operation::new(OpKind::Convolution, attrs).unwrap(),
                vec![x, w],
            )
            .unwrap();
        let y = graph.result(conv).unwrap();
        let floor = graph
            .add_node(&registry, "floor", Operation::simple(OpKind::Floor).unwrap(), vec![y])
            .unwrap();
        graph.mark_output(graph.result(floor).unwrap()).unwrap();
        (graph, conv, floor)
    }

    #[test]
    fn test_rewrite_wires_slices_tiles_and_concat() {
        let registry = OpRegistry::standard();
        let (mut graph, conv, floor) = conv_graph(16);
        let view = graph.op_view(conv).unwrap();
        // Whole: 2048 + 2304 + 2048 bytes.
        let plan = Planner::new(&registry, MemoryBudget::new(5000, 1))
            .plan(&view, TilingMode::Isolated, &mut vec![])
            .unwrap();
        assert_eq!(plan.len(), 2);

        let mut diagnostics = vec![];
        let rewritten = rewrite(&mut graph, conv, &plan, &registry, &mut diagnostics)
            .unwrap()
            .unwrap();
        // The filter is read whole by both tiles; only the input is sliced.
        assert_eq!(rewritten.slices.len(), 2);
        assert_eq!(rewritten.tiles.len(), 2);
        assert!(!graph.node(conv).unwrap().is_live());

        let concat_out = graph.result(rewritten.concat).unwrap();
        assert_eq!(graph.node(floor).unwrap().operands, vec![concat_out]);
        assert_eq!(
            graph.value(concat_out).unwrap().ty.shape(),
            shape![1, 16, 16, 8]
        );
        let order = graph.topo_order();
        let pos = |n| order.iter().position(|&m| m == n).unwrap();
        assert!(rewritten.tiles.iter().all(|&t| pos(t) < pos(rewritten.concat)));
        assert!(pos(rewritten.concat) < pos(floor));
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_single_tile_plan_leaves_graph_alone() {
        let registry = OpRegistry::standard();
        let (mut graph, conv, _) = conv_graph(4);
        let view = graph.op_view(conv).unwrap();
        let plan = Planner::new(&registry, MemoryBudget::default())
            .plan(&view, TilingMode::Isolated, &mut vec![])
            .unwrap();
        let before = graph.clone();
        assert_eq!(rewrite(&mut graph, conv, &plan, &registry, &mut vec![]).unwrap(), None);
        assert_eq!(graph, before);
    }

    #[test]
    fn test_pass_tiles_what_does_not_fit() {
        let registry = OpRegistry::standard();
        let (mut graph, conv, floor) = conv_graph(16);
        let config = config(5000);
        let mut diagnostics = vec![];
        let stats = TilingPass::new(&registry, &config)
            .run(&mut graph, &mut diagnostics)
            .unwrap();
        assert_eq!(stats.visited, 2);
        assert_eq!(stats.tiled, 1);
        assert_eq!(stats.fallbacks, 0);
        assert!(!graph.node(conv).unwrap().is_live());
        assert!(graph.node(floor).unwrap().is_live());
        let output = graph.outputs()[0];
        assert_eq!(graph.value(output).unwrap().def, ValueDef::Result(floor));
    }

    #[test]
    fn test_pass_keeps_per_channel_quantization() {
        let registry = OpRegistry::standard();
        let quant = Quant::PerAxis {
            axis: 1,
            scales: (0..32).map(|c| 0.5 + f64::from(c)).collect(),
            zero_points: (0..32).collect(),
        };
        let x = TensorSpec::new(shape![1, 32, 1, 1], Dtype::Uint8)
            .with_quant(quant)
            .unwrap();
        let mut graph = Graph::new();
        let x = graph.add_input("x", TensorType::Dense(x));
        let floor = graph
            .add_node(&registry, "floor", Operation::simple(OpKind::Floor).unwrap(), vec![x])
            .unwrap();
        let before = graph.value(graph.result(floor).unwrap()).unwrap().ty.clone();
        graph.mark_output(graph.result(floor).unwrap()).unwrap();

        // 32 bytes in and 32 out; only the channels can be split.
        let stats = TilingPass::new(&registry, &config(40))
            .run(&mut graph, &mut vec![])
            .unwrap();
        assert_eq!(stats.tiled, 1);
        assert_eq!(stats.tiles, 2);
        let output = graph.outputs()[0];
        assert_eq!(graph.value(output).unwrap().ty, before);
    }

    #[test]
    fn test_pass_slices_sparse_operands() {
        let registry = OpRegistry::standard();
        let sparse_graph = |input: TensorType, weights: TensorType| {
            let mut graph = Graph::new();
            let x = graph.add_input("x", input);
            let w = graph.add_constant("w", weights);
            let op = Operation::new(OpKind::Convolution, OpAttrs::Conv(ConvAttrs::unit())).unwrap();
            let conv = graph.add_node(&registry, "conv", op, vec![x, w]).unwrap();
            graph.mark_output(graph.result(conv).unwrap()).unwrap();
            graph
        };
        let slices = |graph: &Graph| -> Vec<SparseTensor> {
            graph
                .live_nodes()
                .filter(|(_, n)| n.op.kind() == OpKind::Slice)
                .filter_map(|(_, n)| match &graph.value(n.result).unwrap().ty {
                    TensorType::Sparse(s) => Some(s.clone()),
                    TensorType::Dense(_) => None,
                })
                .collect()
        };

        // Sparse weights split by output channel.
        let data = TensorSpec::new(shape![32, 16, 1, 1], Dtype::Uint8);
        let mut graph = sparse_graph(
            dense(shape![1, 16, 1, 1], Dtype::Uint8),
            TensorType::Sparse(SparseTensor::weights(data, None).unwrap()),
        );
        let stats = TilingPass::new(&registry, &config(600))
            .run(&mut graph, &mut vec![])
            .unwrap();
        assert_eq!(stats.tiles, 2);
        let weights = slices(&graph);
        assert_eq!(weights.len(), 2);
        for tile in &weights {
            assert_eq!(tile.shape(), shape![16, 16, 1, 1]);
            assert_eq!(tile.sparsity_map().unwrap().shape(), &[16, 1, 1, 128]);
        }

        // A sparse activation with a storage-element table split by rows.
        let data = TensorSpec::new(shape![1, 16, 8, 8], Dtype::Float16);
        let map = TensorSpec::new(shape![1, 16, 8, 8], Dtype::Bool);
        let table = TensorSpec::new(shape![1, 1, 8, 8], Dtype::Sint32);
        let input = SparseTensor::new(data, Some(map), Some(table), false, None, None).unwrap();
        let mut graph = sparse_graph(
            TensorType::Sparse(input),
            dense(shape![16, 16, 1, 1], Dtype::Float16),
        );
        let stats = TilingPass::new(&registry, &config(3000))
            .run(&mut graph, &mut vec![])
            .unwrap();
        assert_eq!(stats.tiles, 2);
        let rows = slices(&graph);
        assert_eq!(rows.len(), 2);
        for tile in &rows {
            assert_eq!(tile.shape(), shape![1, 16, 4, 8]);
            assert_eq!(tile.se_table().unwrap().shape(), &[1, 1, 4, 8]);
        }
    }

    #[test]
    fn test_untileable_operation_falls_back_or_fails() {
        let registry = OpRegistry::standard();
        let build = || {
            let mut graph = Graph::new();
            let x = graph.add_input("x", dense(shape![16, 16], Dtype::Float32));
            let reshape = graph
                .add_node(
                    &registry,
                    "reshape",
                    Operation::new(OpKind::AffineReshape, OpAttrs::Reshape { shape: shape![256] })
                        .unwrap(),
                    vec![x],
                )
                .unwrap();
            graph.mark_output(graph.result(reshape).unwrap()).unwrap();
            graph
        };

        let mut diagnostics = vec![];
        let stats = TilingPass::new(&registry, &config(256))
            .run(&mut build(), &mut diagnostics)
            .unwrap();
        assert_eq!(stats.fallbacks, 1);
        assert!(diagnostics.iter().any(|d| d.severity == Severity::Warning));

        let strict = CompilerConfig {
            allow_fallback: false,
            ..config(256)
        };
        let err = TilingPass::new(&registry, &strict)
            .run(&mut build(), &mut vec![])
            .unwrap_err();
        assert!(matches!(err, CompileError::NoFallback { ref loc, .. } if loc == "reshape"));
    }

    #[test]
    fn test_failed_prefetch_retries_isolated() {
        let registry = OpRegistry::standard();
        let mut graph = Graph::new();
        let x = graph.add_input("x", dense(shape![1, 1, 4, 4], Dtype::Uint8));
        let z = graph.add_input("z", dense(shape![1, 1, 4, 4], Dtype::Uint8));
        let floor = graph
            .add_node(&registry, "floor", Operation::simple(OpKind::Floor).unwrap(), vec![x])
            .unwrap();
        let y = graph.result(floor).unwrap();
        let add = graph
            .add_node(&registry, "add", Operation::simple(OpKind::Add).unwrap(), vec![y, z])
            .unwrap();
        graph.mark_output(graph.result(add).unwrap()).unwrap();

        // The floor fits alone (32 bytes) but never next to the add's other input
        // once the reserve is taken, whatever the split.
        let config = CompilerConfig {
            budget: MemoryBudget::new(48, 1).with_reserved(40),
            enable_prefetch: true,
            ..CompilerConfig::default()
        };
        let mut diagnostics = vec![];
        let stats = TilingPass::new(&registry, &config)
            .run(&mut graph, &mut diagnostics)
            .unwrap();
        assert_eq!(stats.prefetch_retries, 1);
        assert_eq!(stats.tiled, 0);
        assert!(graph.node(floor).unwrap().is_live());
    }

    #[test]
    fn test_large_constants_select_large_constant_mode() {
        let registry = OpRegistry::standard();
        let (graph, conv, floor) = conv_graph(4);
        let config = CompilerConfig {
            budget: MemoryBudget::new(4096, 1),
            ..CompilerConfig::default()
        };
        let pass = TilingPass::new(&registry, &config);
        // 2304 bytes of filter exceed half of 4096.
        assert_eq!(
            pass.select_mode(&graph, conv, Some(floor)).unwrap(),
            TilingMode::LargeConstant
        );
        assert_eq!(
            pass.select_mode(&graph, floor, None).unwrap(),
            TilingMode::Isolated
        );
    }

    #[test]
    fn test_run_all_processes_every_graph() {
        let registry = OpRegistry::standard();
        let config = config(5000);
        let mut graphs = vec![conv_graph(16).0, conv_graph(2).0, conv_graph(32).0];
        let results = TilingPass::new(&registry, &config).run_all(&mut graphs);
        let tiled: Vec<usize> = results
            .into_iter()
            .map(|(r, _)| r.unwrap().tiled)
            .collect();
        // The largest graph's floor needs tiling too.
        assert_eq!(tiled, vec![1, 0, 2]);
    }
}
