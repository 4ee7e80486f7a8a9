use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path;
use std::str::FromStr;

use tilefit::common::{DimSize, Dtype, Shape};
use tilefit::config::CompilerConfig;
use tilefit::diagnostics::LogSink;
use tilefit::dma::{decompose, upsampling_transfer, StridedTransfer};
use tilefit::layout::nhwc;
use tilefit::ops::{ConvAttrs, OpAttrs, OpKind, OpRegistry, OpView, Operation};
use tilefit::pprint::{pprint_plan, pprint_transfers};
use tilefit::region::PadInfo;
use tilefit::search::Planner;
use tilefit::tensorspec::{TensorSpec, TensorType};
use tilefit::tiling::TilingMode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long, short)]
    config: Option<path::PathBuf>,

    /// Local memory capacity in bytes
    #[arg(long)]
    capacity: Option<u64>,

    #[arg(long)]
    alignment: Option<u64>,

    /// Fragmentation headroom, applied in prefetch mode
    #[arg(long)]
    reserved: Option<u64>,

    #[arg(long)]
    max_split: Option<u32>,

    #[arg(long, value_enum, default_value_t = SearchMode::Isolated)]
    mode: SearchMode,

    /// Bytes of the next operation's inputs to leave room for in prefetch mode
    #[arg(long, default_value = "0")]
    next_input_bytes: u64,

    /// Write the plan to this file with bincode
    #[arg(long)]
    save: Option<path::PathBuf>,

    #[command(subcommand)]
    query: Query,
}

#[derive(Copy, Clone, PartialEq, clap::ValueEnum)]
enum SearchMode {
    Isolated,
    Prefetch,
    LargeConstant,
}

#[derive(clap::Subcommand)]
enum Query {
    #[command(about = "Tile a convolution")]
    Conv {
        #[arg(long, short, default_value = "1")]
        batch: DimSize,
        #[arg(long, default_value = "16")]
        channels: DimSize,
        #[arg(long, default_value = "16")]
        filters: DimSize,
        #[arg(long, default_value = "3")]
        filters_size: DimSize,
        #[arg(long, default_value = "1")]
        stride: u32,
        #[arg(long, default_value = "0")]
        pad: u32,
        #[arg(long, default_value = "1")]
        groups: u32,
        #[arg(long, value_enum, default_value_t = Dtype::Float16)]
        dtype: Dtype,
        size: DimSize,
    },
    #[command(about = "Tile an element-wise operation")]
    Eltwise {
        /// Operation kind, e.g. Add or Floor
        kind: String,
        #[arg(long, value_enum, default_value_t = Dtype::Float16)]
        dtype: Dtype,
        #[arg(required = true)]
        shape: Vec<DimSize>,
    },
    #[command(about = "Split a bulk transfer into DMA descriptors")]
    Dma {
        /// Number of planes
        planes: u32,
        /// Bytes per plane
        len: u32,
        #[arg(long, default_value = "0")]
        src_offset: u64,
        #[arg(long, default_value = "0")]
        dst_offset: u64,
        /// Instead, unroll a 2x upsampling copy of an NHWC tensor of this shape
        #[arg(long, num_args = 4, value_names = ["N", "C", "H", "W"])]
        upsample: Option<Vec<DimSize>>,
        /// Print descriptor records as hex
        #[arg(long)]
        descriptors: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args)?;
    match &args.query {
        Query::Dma {
            planes,
            len,
            src_offset,
            dst_offset,
            upsample,
            descriptors,
        } => {
            let transfer = match upsample {
                Some(shape) => {
                    let input = TensorSpec::new(Shape::from_slice(shape), Dtype::Float16)
                        .with_order(nhwc())?;
                    upsampling_transfer(&input, [2, 2], 0, *src_offset, *dst_offset)?
                }
                None => StridedTransfer::contiguous(*planes, *len, *src_offset, *dst_offset),
            };
            let (max_planes, engines) = config.dma.limits()?;
            let plan = decompose(&transfer, max_planes, engines);
            pprint_transfers(&plan);
            if *descriptors {
                for descriptor in plan.descriptors() {
                    let hex: String = descriptor
                        .to_bytes()
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect();
                    println!("{hex}");
                }
            }
            save(&args, &plan)
        }
        query => {
            let registry = OpRegistry::standard();
            let view = build_view(&registry, query)?;
            let mode = match args.mode {
                SearchMode::Isolated => TilingMode::Isolated,
                SearchMode::Prefetch => TilingMode::Prefetch {
                    next_input_bytes: args.next_input_bytes,
                },
                SearchMode::LargeConstant => TilingMode::LargeConstant,
            };
            let planner = Planner {
                registry: &registry,
                budget: config.budget,
                max_split_factor: config.max_split_factor,
            };
            let start_time = std::time::Instant::now();
            let plan = planner.plan(&view, mode, &mut LogSink)?;
            info!("planning took {:?}", start_time.elapsed());
            println!("{}: {} -> {}", view.loc, view.op, view.output);
            pprint_plan(&plan);
            save(&args, &plan)
        }
    }
}

fn load_config(args: &Args) -> Result<CompilerConfig> {
    let mut config = match &args.config {
        Some(path) => CompilerConfig::load(path)?,
        None => CompilerConfig::default(),
    };
    if let Some(capacity) = args.capacity {
        config.budget.capacity = capacity;
    }
    if let Some(alignment) = args.alignment {
        config.budget.alignment = alignment;
    }
    if let Some(reserved) = args.reserved {
        config.budget.reserved = reserved;
    }
    if let Some(max_split) = args.max_split {
        config.max_split_factor = max_split;
    }
    config.validate()?;
    Ok(config)
}

fn build_view(registry: &OpRegistry, query: &Query) -> Result<OpView> {
    let view = match query {
        Query::Conv {
            batch,
            channels,
            filters,
            filters_size,
            stride,
            pad,
            groups,
            dtype,
            size,
        } => {
            let attrs = ConvAttrs::new(
                [*stride; 2],
                [1, 1],
                PadInfo::new(*pad, *pad, *pad, *pad),
                *groups,
            )?;
            let kind = if *groups == 1 {
                OpKind::Convolution
            } else {
                OpKind::GroupConvolution
            };
            if channels % groups != 0 {
                bail!("{channels} channels cannot form {groups} groups");
            }
            let input = TensorSpec::new(
                Shape::from_slice(&[*batch, *channels, *size, *size]),
                *dtype,
            );
            let weights = TensorSpec::new(
                Shape::from_slice(&[*filters, channels / groups, *filters_size, *filters_size]),
                *dtype,
            );
            registry
                .view(
                    "conv",
                    Operation::new(kind, OpAttrs::Conv(attrs))?,
                    vec![TensorType::Dense(input), TensorType::Dense(weights)],
                )?
                .with_constants(vec![false, true])
        }
        Query::Eltwise { kind, dtype, shape } => {
            let kind = OpKind::from_str(kind).with_context(|| format!("unknown operation {kind}"))?;
            let arity = match kind {
                OpKind::Add | OpKind::Multiply | OpKind::NotEqual => 2,
                OpKind::Floor | OpKind::Selu => 1,
                _ => bail!("{kind} is not element-wise"),
            };
            let operand = TensorType::Dense(TensorSpec::new(Shape::from_slice(shape), *dtype));
            registry.view("eltwise", Operation::simple(kind)?, vec![operand; arity])?
        }
        Query::Dma { .. } => bail!("not an operation"),
    };
    Ok(view)
}

fn save<T: serde::Serialize>(args: &Args, value: &T) -> Result<()> {
    let Some(path) = &args.save else {
        return Ok(());
    };
    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    bincode::serialize_into(std::io::BufWriter::new(file), value)?;
    info!("saved to {}", path.display());
    Ok(())
}
