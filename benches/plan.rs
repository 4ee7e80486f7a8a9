use iai_callgrind::{black_box, main};

use tilefit::common::Dtype;
use tilefit::diagnostics::NullSink;
use tilefit::memorylimits::MemoryBudget;
use tilefit::ops::{ConvAttrs, OpAttrs, OpKind, OpRegistry, OpView, Operation};
use tilefit::region::PadInfo;
use tilefit::search::Planner;
use tilefit::shape;
use tilefit::tensorspec::{TensorSpec, TensorType};
use tilefit::tiling::TilingMode;

#[export_name = "tilefit_bench_plan::conv_view"]
fn conv_view(registry: &OpRegistry, size: u32) -> OpView {
    let attrs = ConvAttrs::new([1, 1], [1, 1], PadInfo::new(1, 1, 1, 1), 1).unwrap();
    registry
        .view(
            "conv",
            Operation::new(OpKind::Convolution, OpAttrs::Conv(attrs)).unwrap(),
            vec![
                TensorType::Dense(TensorSpec::new(shape![1, 64, size, size], Dtype::Float16)),
                TensorType::Dense(TensorSpec::new(shape![64, 64, 3, 3], Dtype::Float16)),
            ],
        )
        .unwrap()
        .with_constants(vec![false, true])
}

fn plan(size: u32, mode: TilingMode) {
    let registry = OpRegistry::standard();
    let view = conv_view(&registry, size);
    let planner = Planner::new(&registry, MemoryBudget::default());
    let _ = planner.plan(black_box(&view), mode, &mut NullSink);
}

#[inline(never)]
fn plan_conv_isolated_benchmark() {
    plan(112, TilingMode::Isolated);
}

#[inline(never)]
fn plan_conv_large_constant_benchmark() {
    plan(112, TilingMode::LargeConstant);
}

main!(
    callgrind_args = "toggle-collect=tilefit_bench_plan::conv_view",
        "--simulate-wb=no", "--simulate-hwpref=yes",
        "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64";
    functions = plan_conv_isolated_benchmark, plan_conv_large_constant_benchmark
);
