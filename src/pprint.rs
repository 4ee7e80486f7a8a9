use crate::dma::TransferPlan;
use crate::tiling::TilingPlan;
use crate::utils::join_into_string;

use prettytable::{self, format, row, Table};

/// One row per tile: output region, operand regions, attributes and memory use.
pub fn plan_table(plan: &TilingPlan) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["", "Output", "Operands", "Pads", "Attributes", "Bytes"]);
    for (i, tile) in plan.tiles.iter().enumerate() {
        let pads = tile.pads.map(|p| p.to_string()).unwrap_or_default();
        table.add_row(row![
            i,
            tile.output,
            join_into_string(&tile.operands, ", "),
            pads,
            tile.attrs,
            r->tile.required_bytes
        ]);
    }
    table.set_format(compact_format());
    table
}

/// One row per descriptor, in emission order.
pub fn transfer_table(plan: &TransferPlan) -> Table {
    let mut table = Table::new();
    table.set_titles(row![
        "Port", "Planes", "Len", "Src", "Src stride", "Src plane", "Dst", "Dst stride", "Dst plane"
    ]);
    for sub in &plan.transfers {
        let t = &sub.transfer;
        table.add_row(row![
            r->sub.port,
            r->t.planes,
            r->t.len,
            r->t.src.offset,
            r->t.src.stride,
            r->t.src.plane_stride,
            r->t.dst.offset,
            r->t.dst.stride,
            r->t.dst.plane_stride
        ]);
    }
    table.set_format(compact_format());
    table
}

pub fn pprint_plan(plan: &TilingPlan) {
    println!(
        "{} tile(s), divisors [{}], {} mode",
        plan.len(),
        join_into_string(&plan.divisors, ", "),
        plan.mode
    );
    plan_table(plan).printstd();
}

pub fn pprint_transfers(plan: &TransferPlan) {
    println!("{} descriptor(s)", plan.len());
    transfer_table(plan).printstd();
}

fn compact_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{decompose, StridedTransfer};
    use crate::ops::OpAttrs;
    use crate::region::Region;
    use crate::shape;
    use crate::tiling::{divided_regions, TileInfo, TilingMode};
    use nonzero::nonzero as nz;

    #[test]
    fn test_plan_table_has_a_row_per_tile() {
        let tiles = divided_regions(&[4, 4], &[2, 1])
            .into_iter()
            .map(|output| TileInfo {
                operands: vec![output.clone()],
                output,
                pads: None,
                attrs: OpAttrs::None,
                required_bytes: 64,
            })
            .collect();
        let plan = TilingPlan {
            divisors: shape![2, 1],
            tiles,
            mode: TilingMode::Isolated,
        };
        let table = plan_table(&plan);
        assert_eq!(table.len(), 2);
        let rendered = table.to_string();
        assert!(rendered.contains(&Region::new(shape![2, 0], shape![2, 4]).to_string()));
    }

    #[test]
    fn test_transfer_table_has_a_row_per_descriptor() {
        let plan = decompose(&StridedTransfer::contiguous(10, 4, 0, 0), nz!(4u32), nz!(2u8));
        assert_eq!(transfer_table(&plan).len(), 3);
    }
}
