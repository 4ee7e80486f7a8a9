//! Splitting of bulk strided transfers into hardware-sized descriptors.

use crate::common::{act, Dtype};
use crate::layout::{nhwc, row_major, DimsOrder};
use crate::tensorspec::TensorSpec;

use serde::{Deserialize, Serialize};
use std::num::{NonZeroU32, NonZeroU8};

/// One side (source or destination) of a strided transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct DmaSide {
    /// Byte offset of the first plane.
    pub offset: u64,
    /// Bytes moved before jumping by `stride`.
    pub width: u32,
    pub stride: u32,
    /// Bytes between the starts of consecutive planes.
    pub plane_stride: u32,
}

/// `planes` repetitions of a `len`-byte copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct StridedTransfer {
    pub planes: u32,
    pub len: u32,
    pub src: DmaSide,
    pub dst: DmaSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SubTransfer {
    pub transfer: StridedTransfer,
    pub port: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TransferPlan {
    pub transfers: Vec<SubTransfer>,
}

/// The fixed-layout record a DMA engine consumes for one sub-transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DmaDescriptor {
    pub num_planes: u32,
    pub len: u32,
    pub src_width: u32,
    pub src_stride: u32,
    pub src_plane_stride: u32,
    pub dst_width: u32,
    pub dst_stride: u32,
    pub dst_plane_stride: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DmaError {
    #[error("Upsampling transfers need a rank-4 tensor, got rank {0}")]
    NotRank4(usize),
    #[error("Upsampling transfers need an NCHW or NHWC layout, got {0:?}")]
    UnsupportedOrder(DimsOrder),
    #[error("Elements of {0} are not whole bytes")]
    SubByteElement(Dtype),
    #[error("Transfer field `{0}` overflows 32 bits")]
    Overflow(&'static str),
}

impl StridedTransfer {
    /// A plain copy of `planes` contiguous runs of `len` bytes.
    pub fn contiguous(planes: u32, len: u32, src_offset: u64, dst_offset: u64) -> Self {
        let side = |offset| DmaSide {
            offset,
            width: len,
            stride: len,
            plane_stride: len,
        };
        StridedTransfer {
            planes,
            len,
            src: side(src_offset),
            dst: side(dst_offset),
        }
    }

    pub fn src_end(&self) -> u64 {
        self.src.offset + u64::from(self.planes) * u64::from(self.src.plane_stride)
    }

    pub fn dst_end(&self) -> u64 {
        self.dst.offset + u64::from(self.planes) * u64::from(self.dst.plane_stride)
    }
}

impl TransferPlan {
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn total_planes(&self) -> u64 {
        self.transfers
            .iter()
            .map(|t| u64::from(t.transfer.planes))
            .sum()
    }

    pub fn descriptors(&self) -> Vec<DmaDescriptor> {
        self.transfers
            .iter()
            .map(|t| DmaDescriptor::from(&t.transfer))
            .collect()
    }
}

/// Splits `transfer` into sub-transfers of at most `max_planes` planes, assigning
/// engine ports round-robin in emission order.
///
/// Every sub-transfer but the last carries `max_planes` planes. Source and destination
/// offsets advance independently by the planes moved times their own plane stride.
pub fn decompose(
    transfer: &StridedTransfer,
    max_planes: NonZeroU32,
    engines: NonZeroU8,
) -> TransferPlan {
    let max_planes = max_planes.get();
    let count = divrem::DivCeil::div_ceil(transfer.planes, max_planes);
    let mut src = transfer.src;
    let mut dst = transfer.dst;
    let transfers = (0..count)
        .map(|i| {
            let planes = max_planes.min(transfer.planes - i * max_planes);
            let sub = StridedTransfer {
                planes,
                src,
                dst,
                ..*transfer
            };
            src.offset = sub.src_end();
            dst.offset = sub.dst_end();
            SubTransfer {
                transfer: sub,
                port: (i % u32::from(engines.get())) as u8,
            }
        })
        .collect();
    TransferPlan { transfers }
}

/// The strided copy writing `input` into an upsampled buffer: every element lands at
/// the top-left of its `factors[0] x factors[1]` cell, and each output pixel carries
/// `expand_channels` extra channels.
///
/// NHWC tensors move one plane per input row (`N * H` planes); NCHW tensors one per
/// row of every channel (`N * C * H`).
pub fn upsampling_transfer(
    input: &TensorSpec,
    factors: [u32; 2],
    expand_channels: u32,
    src_offset: u64,
    dst_offset: u64,
) -> Result<StridedTransfer, DmaError> {
    let shape = input.shape();
    if shape.len() != 4 {
        return Err(DmaError::NotRank4(shape.len()));
    }
    if input.elem_bits() % 8 != 0 {
        return Err(DmaError::SubByteElement(input.dtype()));
    }
    let elem = u64::from(input.elem_bits() / 8);
    let (n, c, h, w) = (
        u64::from(shape[act::N]),
        u64::from(shape[act::C]),
        u64::from(shape[act::H]),
        u64::from(shape[act::W]),
    );
    let (planes, channels) = if *input.order() == nhwc() {
        (n * h, c)
    } else if *input.order() == row_major(4) {
        (n * c * h, 1)
    } else {
        return Err(DmaError::UnsupportedOrder(input.order().clone()));
    };
    let [fh, fw] = factors.map(u64::from);
    let expanded = channels + u64::from(expand_channels);
    let row = w * channels * elem;
    let narrow = |value: u64, field| u32::try_from(value).map_err(|_| DmaError::Overflow(field));
    Ok(StridedTransfer {
        planes: narrow(planes, "planes")?,
        len: narrow(row, "len")?,
        src: DmaSide {
            offset: src_offset,
            width: narrow(row, "src_width")?,
            stride: narrow(row, "src_stride")?,
            plane_stride: narrow(row, "src_plane_stride")?,
        },
        dst: DmaSide {
            offset: dst_offset,
            width: narrow(channels * elem, "dst_width")?,
            stride: narrow(expanded * elem * fw, "dst_stride")?,
            plane_stride: narrow(w * expanded * elem * fh * fw, "dst_plane_stride")?,
        },
    })
}

impl From<&StridedTransfer> for DmaDescriptor {
    fn from(t: &StridedTransfer) -> Self {
        DmaDescriptor {
            num_planes: t.planes,
            len: t.len,
            src_width: t.src.width,
            src_stride: t.src.stride,
            src_plane_stride: t.src.plane_stride,
            dst_width: t.dst.width,
            dst_stride: t.dst.stride,
            dst_plane_stride: t.dst.plane_stride,
        }
    }
}

impl DmaDescriptor {
    pub const SIZE: usize = 32;

    /// The record as eight little-endian words, in field order.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.num_planes,
            self.len,
            self.src_width,
            self.src_stride,
            self.src_plane_stride,
            self.dst_width,
            self.dst_stride,
            self.dst_plane_stride,
        ];
        let mut bytes = [0; Self::SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}
