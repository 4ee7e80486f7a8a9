use crate::common::{DimSize, Shape};
use crate::diagnostics::{DiagnosticSink, LogSink};
use crate::memorylimits::{aligned_requirement, fits, MemoryBudget};
use crate::ops::{BackInferError, BackInferFn, IllegalSplit, OpKind, OpRegistry, OpRules, OpView};
use crate::region::Region;
use crate::tensorspec::TensorType;
use crate::tiling::{divided_regions, effective_count, tile_size, TileInfo, TilingMode, TilingPlan};

use smallvec::smallvec;

pub const DEFAULT_MAX_SPLIT_FACTOR: u32 = 1024;

/// Plans the tiling of single operations against one memory budget.
#[derive(Clone, Copy)]
pub struct Planner<'a> {
    pub registry: &'a OpRegistry,
    pub budget: MemoryBudget,
    /// Upper bound on the number of tiles of one plan.
    pub max_split_factor: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TilingError {
    #[error("{loc}: operation is untileable: {reason}")]
    Untileable {
        loc: String,
        reason: UntileableReason,
    },
    #[error("{loc}: no plan of at most {max_split_factor} tiles fits in {budget}")]
    SearchExhausted {
        loc: String,
        max_split_factor: u32,
        budget: MemoryBudget,
    },
    #[error("{loc}: {source}")]
    RegionViolation {
        loc: String,
        source: BackInferError,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UntileableReason {
    #[error("{0} has no registered rules")]
    NotRegistered(OpKind),
    #[error("{0} has no back-inference rule")]
    NoBackInference(OpKind),
    #[error("no dimension can be split legally")]
    NoLegalSplit,
    #[error(transparent)]
    BackInfer(BackInferError),
}

impl TilingError {
    /// Whether a caller may fall back to running the operation untiled. Region
    /// violations indicate malformed operations and are never recoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TilingError::RegionViolation { .. })
    }

    pub fn loc(&self) -> &str {
        match self {
            TilingError::Untileable { loc, .. }
            | TilingError::SearchExhausted { loc, .. }
            | TilingError::RegionViolation { loc, .. } => loc,
        }
    }
}

/// Plans `view` with the standard registry and the default split limit.
pub fn plan(
    view: &OpView,
    mode: TilingMode,
    budget: &MemoryBudget,
) -> Result<TilingPlan, TilingError> {
    let registry = OpRegistry::standard();
    let planner = Planner {
        registry: &registry,
        budget: *budget,
        max_split_factor: DEFAULT_MAX_SPLIT_FACTOR,
    };
    planner.plan(view, mode, &mut LogSink)
}

/// Dimensions in the order they are tried: batch, then spatial, then channels last.
pub fn split_preference(rank: usize) -> Vec<usize> {
    if rank < 3 {
        return (0..rank).collect();
    }
    let mut order = vec![0];
    order.extend(2..rank);
    order.push(1);
    order
}

enum TileFailure {
    Illegal(IllegalSplit),
    Fatal(TilingError),
}

struct Tiles {
    tiles: Vec<TileInfo>,
    all_fit: bool,
}

impl<'a> Planner<'a> {
    pub fn new(registry: &'a OpRegistry, budget: MemoryBudget) -> Self {
        Planner {
            registry,
            budget,
            max_split_factor: DEFAULT_MAX_SPLIT_FACTOR,
        }
    }

    /// Finds a tiling of `view` whose every tile fits the budget.
    ///
    /// Split factors grow one dimension at a time, in [split_preference] order (or by
    /// constant-operand shrinkage in [TilingMode::LargeConstant]). A dimension keeps its
    /// largest legal factor once it is exhausted and the search moves on to the next.
    /// The result is a pure function of the arguments.
    pub fn plan(
        &self,
        view: &OpView,
        mode: TilingMode,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<TilingPlan, TilingError> {
        let kind = view.op.kind();
        let untileable = |reason| TilingError::Untileable {
            loc: view.loc.clone(),
            reason,
        };
        let rules = self
            .registry
            .get(kind)
            .ok_or_else(|| untileable(UntileableReason::NotRegistered(kind)))?;
        let (reserve, extra) = match mode {
            TilingMode::Prefetch { next_input_bytes } => (true, vec![next_input_bytes]),
            _ => (false, vec![]),
        };

        let mut whole = (rules.buffer_sizes)(&view.operands, &view.output);
        whole.extend(&extra);
        if fits(&whole, &self.budget, reserve) {
            log::debug!("{}: {} fits untiled", view.loc, view.op);
            return Ok(single_tile_plan(view, mode, aligned_requirement(&whole, &self.budget)));
        }
        let Some(back_infer) = rules.back_infer else {
            return Err(untileable(UntileableReason::NoBackInference(kind)));
        };

        let out_shape = view.output.shape();
        let rank = out_shape.len();
        let reductions = if rules.splits_reductions {
            vec![]
        } else {
            (rules.reduction_axes)(view.op.attrs(), rank)
        };
        let mut dims = match mode {
            TilingMode::LargeConstant => self.constant_shrink_order(view, back_infer, sink),
            _ => split_preference(rank),
        };
        dims.retain(|&d| {
            if out_shape[d] <= 1 {
                return false;
            }
            if reductions.contains(&d) {
                sink.note(&view.loc, &format!("not splitting reduction axis {d}"));
                return false;
            }
            true
        });

        let mut divisors: Shape = smallvec![1; rank];
        let mut any_legal = false;
        for &dim in &dims {
            let extent = out_shape[dim];
            let mut candidate = divisors[dim];
            while let Some(next) = next_divisor(extent, candidate) {
                candidate = next;
                let mut trial = divisors.clone();
                trial[dim] = next;
                let tile_count: u64 = out_shape
                    .iter()
                    .zip(&trial)
                    .map(|(&e, &n)| u64::from(effective_count(e, n)))
                    .product();
                if tile_count > u64::from(self.max_split_factor) {
                    return Err(self.exhausted(view));
                }
                if let Some(legality) = rules.split_legality {
                    if let Err(reason) = legality(view, dim, tile_size(extent, next)) {
                        sink.note(
                            &view.loc,
                            &format!("splitting dimension {dim} into {next} is illegal: {reason}"),
                        );
                        continue;
                    }
                }
                match self.build_tiles(view, rules, back_infer, &trial, &extra, reserve) {
                    Ok(Tiles {
                        tiles,
                        all_fit: true,
                    }) => {
                        let divisors = out_shape
                            .iter()
                            .zip(&trial)
                            .map(|(&e, &n)| effective_count(e, n))
                            .collect();
                        log::debug!(
                            "{}: {} split into {} tiles ({})",
                            view.loc,
                            view.op,
                            tiles.len(),
                            mode
                        );
                        return Ok(TilingPlan {
                            divisors,
                            tiles,
                            mode,
                        });
                    }
                    Ok(_) => {
                        divisors = trial;
                        any_legal = true;
                    }
                    Err(TileFailure::Illegal(reason)) => {
                        sink.note(
                            &view.loc,
                            &format!("splitting dimension {dim} into {next} is illegal: {reason}"),
                        );
                    }
                    Err(TileFailure::Fatal(err)) => return Err(err),
                }
            }
        }
        if any_legal {
            Err(self.exhausted(view))
        } else {
            Err(untileable(UntileableReason::NoLegalSplit))
        }
    }

    /// Back-infers and sizes every tile of `divisors`.
    fn build_tiles(
        &self,
        view: &OpView,
        rules: &OpRules,
        back_infer: BackInferFn,
        divisors: &[DimSize],
        extra: &[u64],
        reserve: bool,
    ) -> Result<Tiles, TileFailure> {
        let shapes = view.operand_shapes();
        let mut tiles = vec![];
        let mut all_fit = true;
        for output in divided_regions(&view.output.shape(), divisors) {
            let inference =
                back_infer(&output, &shapes, view.op.attrs()).map_err(|e| classify(view, e))?;
            for (operand, (region, shape)) in inference.operands.iter().zip(&shapes).enumerate() {
                if region.check_within(shape).is_err() {
                    return Err(TileFailure::Fatal(TilingError::RegionViolation {
                        loc: view.loc.clone(),
                        source: BackInferError::RegionViolation {
                            operand,
                            region: region.clone(),
                            shape: shape.clone(),
                        },
                    }));
                }
            }
            let operand_tiles = view
                .operands
                .iter()
                .zip(&inference.operands)
                .map(|(t, r)| t.extract_tile(r))
                .collect::<Result<Vec<TensorType>, _>>()
                .map_err(|e| TileFailure::Illegal(e.into()))?;
            let output_tile = view
                .output
                .extract_tile(&output)
                .map_err(|e| TileFailure::Illegal(e.into()))?;
            let mut buffers = (rules.buffer_sizes)(&operand_tiles, &output_tile);
            buffers.extend(extra);
            all_fit &= fits(&buffers, &self.budget, reserve);
            tiles.push(TileInfo {
                output,
                operands: inference.operands,
                pads: inference.pads,
                attrs: inference.attrs,
                required_bytes: aligned_requirement(&buffers, &self.budget),
            });
        }
        Ok(Tiles { tiles, all_fit })
    }

    /// Orders dimensions by how small constant operands become when the dimension is
    /// halved, smallest first. Ties keep [split_preference] order.
    fn constant_shrink_order(
        &self,
        view: &OpView,
        back_infer: BackInferFn,
        sink: &mut dyn DiagnosticSink,
    ) -> Vec<usize> {
        let out_shape = view.output.shape();
        let preference = split_preference(out_shape.len());
        if !view.constant.iter().any(|&c| c) {
            sink.note(&view.loc, "no constant operands; using the default split order");
            return preference;
        }
        let shapes = view.operand_shapes();
        let mut scored: Vec<(u64, usize)> = preference
            .into_iter()
            .map(|dim| {
                let mut divisors: Shape = smallvec![1; out_shape.len()];
                divisors[dim] = 2;
                let first = divided_regions(&out_shape, &divisors).swap_remove(0);
                let score = back_infer(&first, &shapes, view.op.attrs())
                    .ok()
                    .and_then(|inference| constant_bytes(view, &inference.operands))
                    .unwrap_or(u64::MAX);
                (score, dim)
            })
            .collect();
        scored.sort_by_key(|&(score, _)| score);
        scored.into_iter().map(|(_, dim)| dim).collect()
    }

    fn exhausted(&self, view: &OpView) -> TilingError {
        TilingError::SearchExhausted {
            loc: view.loc.clone(),
            max_split_factor: self.max_split_factor,
            budget: self.budget,
        }
    }
}

/// The smallest split of `extent` into more than `current` parts which actually
/// produces more tiles.
fn next_divisor(extent: DimSize, current: DimSize) -> Option<DimSize> {
    let produced = effective_count(extent, current);
    (current + 1..=extent).find(|&n| effective_count(extent, n) > produced)
}

fn constant_bytes(view: &OpView, regions: &[Region]) -> Option<u64> {
    view.operands
        .iter()
        .zip(regions)
        .zip(&view.constant)
        .filter(|&(_, &constant)| constant)
        .map(|((t, r), _)| t.extract_tile(r).ok().map(|tile| tile.total_alloc_size()))
        .sum()
}

fn classify(view: &OpView, err: BackInferError) -> TileFailure {
    match err {
        BackInferError::RegionViolation { .. } => TileFailure::Fatal(TilingError::RegionViolation {
            loc: view.loc.clone(),
            source: err,
        }),
        BackInferError::GroupMisaligned { .. } => {
            TileFailure::Illegal(IllegalSplit::Inference(err))
        }
        _ => TileFailure::Fatal(TilingError::Untileable {
            loc: view.loc.clone(),
            reason: UntileableReason::BackInfer(err),
        }),
    }
}

fn single_tile_plan(view: &OpView, mode: TilingMode, required_bytes: u64) -> TilingPlan {
    let out_shape = view.output.shape();
    TilingPlan {
        divisors: smallvec![1; out_shape.len()],
        tiles: vec![TileInfo {
            output: Region::full(&out_shape),
            operands: view
                .operands
                .iter()
                .map(|t| Region::full(&t.shape()))
                .collect(),
            pads: None,
            attrs: view.op.attrs().clone(),
            required_bytes,
        }],
        mode,
    }
}
