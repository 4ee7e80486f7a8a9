use crate::common::{act, filter, DimSize, Dtype, Shape};
use crate::layout::DimsOrder;
use crate::region::Region;
use crate::tensorspec::{MemorySpace, Quant, TensorError, TensorSpec};
use crate::utils::{align_up, div_ceil_u32};

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Weights sparsity maps store one bit per weight, padded per output channel to this many bits.
pub const WEIGHTS_SPARSITY_MAP_ALIGNMENT: u64 = 128;

/// Dense data plus the companion tensors which describe its sparsity.
///
/// Every transformation recomputes the companions from the new data shape and then
/// re-validates the bundle, so a transform which would desynchronize them fails instead.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SparseTensor {
    data: TensorSpec,
    sparsity_map: Option<TensorSpec>,
    se_table: Option<TensorSpec>,
    is_weights: bool,
    compression: Option<CompressionScheme>,
    se_attr: Option<SeUpsampling>,
}

/// Counts of the elements actually stored per index of `axis`.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Deserialize, Serialize)]
pub struct CompressionScheme {
    pub axis: u8,
    pub num_elems: Vec<u64>,
    /// Byte alignment of each unit's storage.
    pub alignment: u64,
}

/// Nearest-neighbour upsampling expressed through the storage-element table: the
/// logical tensor is the data repeated `factors` times along H and W.
///
/// Tiles of an upsampled tensor generally start mid-way through a repeated element, so
/// the attribute also carries a crop (H, W) of the upsampled tensor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize, Serialize)]
pub struct SeUpsampling {
    pub factors: [u32; 2],
    pub offsets: [u32; 2],
    pub sizes: Option<[u32; 2]>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SparseError {
    #[error("Storage-element attributes cannot be combined with weights sparsity or compression")]
    SeAttrConflict,
    #[error("The {what} must have rank 4, got rank {rank}")]
    NotRank4 { what: &'static str, rank: usize },
    #[error("The {companion} shape {got:?} is inconsistent with the expected {expected:?}")]
    CompanionShapeMismatch {
        companion: &'static str,
        expected: Shape,
        got: Shape,
    },
    #[error("Compression over axis {axis} stores {counts} counts for a dimension of size {size}")]
    CompressionMismatch { axis: u8, counts: usize, size: DimSize },
    #[error("Compression axis {compression} differs from the quantization axis {quant}")]
    CompressionQuantAxisMismatch { compression: u8, quant: u8 },
    #[error("Tile {0} cuts a compressed tensor across a dimension other than its compression axis")]
    CompressionTileCut(Region),
    #[error("Sparsity map rows of {bits} bits do not fit a dimension")]
    SparsityMapTooLarge { bits: u64 },
}

/// The shape of the sparsity map of 4-D weights: one row of bits per output channel,
/// each padded to [WEIGHTS_SPARSITY_MAP_ALIGNMENT].
pub fn infer_weights_sparsity_map_shape(weights: &[DimSize]) -> Result<Shape, SparseError> {
    if weights.len() != 4 {
        return Err(SparseError::NotRank4 {
            what: "weights",
            rank: weights.len(),
        });
    }
    let per_channel = u64::from(weights[filter::IC])
        * u64::from(weights[filter::KY])
        * u64::from(weights[filter::KX]);
    let bits = align_up(per_channel, WEIGHTS_SPARSITY_MAP_ALIGNMENT);
    let row = DimSize::try_from(bits).map_err(|_| SparseError::SparsityMapTooLarge { bits })?;
    Ok(Shape::from_slice(&[weights[filter::OC], 1, 1, row]))
}

impl SparseTensor {
    pub fn new(
        data: TensorSpec,
        sparsity_map: Option<TensorSpec>,
        se_table: Option<TensorSpec>,
        is_weights: bool,
        compression: Option<CompressionScheme>,
        se_attr: Option<SeUpsampling>,
    ) -> Result<Self, TensorError> {
        let sparse = SparseTensor {
            data,
            sparsity_map,
            se_table,
            is_weights,
            compression,
            se_attr,
        };
        sparse.verify()?;
        Ok(sparse)
    }

    /// Sparse weights: data plus a 1-bit map shaped by
    /// [infer_weights_sparsity_map_shape].
    pub fn weights(
        data: TensorSpec,
        compression: Option<CompressionScheme>,
    ) -> Result<Self, TensorError> {
        let map_shape = infer_weights_sparsity_map_shape(data.shape())?;
        let map = TensorSpec::new(map_shape, Dtype::Bool).in_space(data.space());
        SparseTensor::new(data, Some(map), None, true, compression, None)
    }

    fn verify(&self) -> Result<(), SparseError> {
        if self.se_attr.is_some() && (self.is_weights || self.compression.is_some()) {
            return Err(SparseError::SeAttrConflict);
        }
        if self.se_attr.is_some() || self.se_table.is_some() {
            check_rank4("data", self.data.shape())?;
        }
        let shape = self.shape();
        if let Some(map) = &self.sparsity_map {
            let expected = if self.is_weights {
                infer_weights_sparsity_map_shape(self.data.shape())?
            } else {
                shape.clone()
            };
            if map.shape() != expected.as_slice() {
                return Err(SparseError::CompanionShapeMismatch {
                    companion: "sparsity map",
                    expected,
                    got: Shape::from(map.shape()),
                });
            }
        }
        if let Some(table) = &self.se_table {
            check_rank4("storage element table", table.shape())?;
            let t = table.shape();
            if t[act::H] != shape[act::H] || t[act::W] != shape[act::W] {
                let mut expected = Shape::from(t);
                expected[act::H] = shape[act::H];
                expected[act::W] = shape[act::W];
                return Err(SparseError::CompanionShapeMismatch {
                    companion: "storage element table",
                    expected,
                    got: Shape::from(t),
                });
            }
        }
        if let Some(scheme) = &self.compression {
            let size = self
                .data
                .shape()
                .get(usize::from(scheme.axis))
                .copied()
                .unwrap_or(0);
            if scheme.num_elems.len() != size as usize {
                return Err(SparseError::CompressionMismatch {
                    axis: scheme.axis,
                    counts: scheme.num_elems.len(),
                    size,
                });
            }
            if let Some(Quant::PerAxis { axis, .. }) = self.data.quant() {
                if *axis != scheme.axis {
                    return Err(SparseError::CompressionQuantAxisMismatch {
                        compression: scheme.axis,
                        quant: *axis,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn data(&self) -> &TensorSpec {
        &self.data
    }

    pub fn sparsity_map(&self) -> Option<&TensorSpec> {
        self.sparsity_map.as_ref()
    }

    pub fn se_table(&self) -> Option<&TensorSpec> {
        self.se_table.as_ref()
    }

    pub fn is_weights(&self) -> bool {
        self.is_weights
    }

    pub fn compression(&self) -> Option<&CompressionScheme> {
        self.compression.as_ref()
    }

    pub fn se_attr(&self) -> Option<&SeUpsampling> {
        self.se_attr.as_ref()
    }

    /// The logical shape consumers see. With a storage-element attribute this is the
    /// upsampled shape, not the shape of the stored data.
    pub fn shape(&self) -> Shape {
        match &self.se_attr {
            Some(se) => se.infer_output_shape(self.data.shape()),
            None => Shape::from(self.data.shape()),
        }
    }

    pub fn num_elements(&self) -> u64 {
        match &self.compression {
            Some(scheme) => scheme.total_num_elems(),
            None => crate::common::volume(&self.shape()),
        }
    }

    pub fn total_alloc_size(&self) -> u64 {
        let data = match &self.compression {
            Some(scheme) => scheme.alloc_size(self.data.dtype()),
            None => self.data.total_alloc_size(),
        };
        data + self.sparsity_map.as_ref().map_or(0, TensorSpec::total_alloc_size)
            + self.se_table.as_ref().map_or(0, TensorSpec::total_alloc_size)
    }

    /// Describes the same kind of sparse tensor with logical shape `shape`.
    pub fn change_shape(&self, shape: &[DimSize]) -> Result<Self, TensorError> {
        let data_shape = match &self.se_attr {
            Some(se) => se.back_infer_shape(shape),
            None => Shape::from(shape),
        };
        let data = self.data.change_shape(&data_shape)?;
        let sparsity_map = match &self.sparsity_map {
            Some(map) if self.is_weights => {
                Some(map.change_shape(&infer_weights_sparsity_map_shape(&data_shape)?)?)
            }
            Some(map) => Some(map.change_shape(shape)?),
            None => None,
        };
        let se_table = self
            .se_table
            .as_ref()
            .map(|t| t.change_shape(&with_spatial(t.shape(), shape)))
            .transpose()?;
        SparseTensor::new(
            data,
            sparsity_map,
            se_table,
            self.is_weights,
            self.compression.clone(),
            self.se_attr.map(|se| se.resized(shape)),
        )
    }

    /// Reorders the data. A weights sparsity map keeps its own order since its layout is
    /// fixed per output channel.
    pub fn change_dims_order(&self, order: DimsOrder) -> Result<Self, TensorError> {
        let sparsity_map = match &self.sparsity_map {
            Some(map) if !self.is_weights => Some(map.change_dims_order(order.clone())?),
            m => m.clone(),
        };
        Ok(SparseTensor {
            data: self.data.change_dims_order(order)?,
            sparsity_map,
            ..self.clone()
        })
    }

    pub fn change_mem_space(&self, space: MemorySpace) -> Self {
        SparseTensor {
            data: self.data.change_mem_space(space),
            sparsity_map: self.sparsity_map.as_ref().map(|m| m.change_mem_space(space)),
            se_table: self.se_table.as_ref().map(|t| t.change_mem_space(space)),
            ..self.clone()
        }
    }

    /// Extracts the tile `region` of the logical shape.
    ///
    /// The weights sparsity map is cut to the tile's output-channel sub-range; the
    /// storage-element table only follows the tile's spatial sub-range.
    pub fn extract_dense_tile(&self, region: &Region) -> Result<Self, TensorError> {
        let shape = self.shape();
        region.check_within(&shape)?;
        let (data_region, se_attr) = match &self.se_attr {
            Some(se) => {
                let (r, tile) = se.tile(region);
                (r, Some(tile))
            }
            None => (region.clone(), None),
        };
        let data = self.data.extract_tile(&data_region)?;
        let sparsity_map = match &self.sparsity_map {
            Some(map) if self.is_weights => {
                let map_shape = infer_weights_sparsity_map_shape(region.shape())?;
                let mut offsets: Shape = smallvec::smallvec![0; map_shape.len()];
                offsets[filter::OC] = region.offsets()[filter::OC];
                Some(map.extract_tile(&Region::new(offsets, map_shape))?)
            }
            Some(map) => Some(map.extract_tile(region)?),
            None => None,
        };
        let se_table = match &self.se_table {
            Some(table) => {
                let mut offsets: Shape = smallvec::smallvec![0; table.rank()];
                offsets[act::H] = region.offsets()[act::H];
                offsets[act::W] = region.offsets()[act::W];
                let table_tile = Region::new(offsets, with_spatial(table.shape(), region.shape()));
                Some(table.extract_tile(&table_tile)?)
            }
            None => None,
        };
        let compression = self
            .compression
            .as_ref()
            .map(|c| c.tile(region, &shape))
            .transpose()?;
        SparseTensor::new(
            data,
            sparsity_map,
            se_table,
            self.is_weights,
            compression,
            se_attr,
        )
    }

    pub fn pad(&self, before: &[DimSize], after: &[DimSize]) -> Result<Self, TensorError> {
        let padded_shape: Shape = {
            let logical = TensorSpec::new(self.shape(), self.data.dtype());
            Shape::from(logical.pad(before, after)?.shape())
        };
        let data = match &self.se_attr {
            Some(se) => self.data.change_shape(&se.back_infer_shape(&padded_shape))?,
            None => self.data.pad(before, after)?,
        };
        let sparsity_map = match &self.sparsity_map {
            Some(map) if self.is_weights => {
                Some(map.change_shape(&infer_weights_sparsity_map_shape(&padded_shape)?)?)
            }
            Some(map) => Some(map.change_shape(&padded_shape)?),
            None => None,
        };
        let se_table = self
            .se_table
            .as_ref()
            .map(|t| t.change_shape(&with_spatial(t.shape(), &padded_shape)))
            .transpose()?;
        SparseTensor::new(
            data,
            sparsity_map,
            se_table,
            self.is_weights,
            self.compression.clone(),
            self.se_attr.map(|se| se.resized(&padded_shape)),
        )
    }
}

impl Display for SparseTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sparse<data={}", self.data)?;
        if let Some(map) = &self.sparsity_map {
            write!(f, ", sparsity_map={map}")?;
        }
        if let Some(table) = &self.se_table {
            write!(f, ", storage_element_table={table}")?;
        }
        if self.is_weights {
            write!(f, ", is_weights")?;
        }
        if let Some(scheme) = &self.compression {
            write!(f, ", compression(axis={})", scheme.axis)?;
        }
        if let Some(se) = &self.se_attr {
            write!(f, ", upsample({}, {})", se.factors[0], se.factors[1])?;
        }
        write!(f, ">")
    }
}

impl CompressionScheme {
    pub fn total_num_elems(&self) -> u64 {
        self.num_elems.iter().sum()
    }

    /// Bytes used by the compressed data, each unit aligned separately.
    pub fn alloc_size(&self, dtype: Dtype) -> u64 {
        self.num_elems
            .iter()
            .map(|&n| align_up(dtype.bytes_for(n), self.alignment))
            .sum()
    }

    /// The scheme of a tile of a tensor of `shape`. Only the compression axis may be cut.
    pub fn tile(&self, region: &Region, shape: &[DimSize]) -> Result<Self, SparseError> {
        let axis = usize::from(self.axis);
        let cuts_other_axis = (0..region.rank())
            .filter(|&d| d != axis)
            .any(|d| region.offsets()[d] != 0 || region.shape()[d] != shape[d]);
        if cuts_other_axis {
            return Err(SparseError::CompressionTileCut(region.clone()));
        }
        let start = region.offsets()[axis] as usize;
        let end = region.end(axis) as usize;
        Ok(CompressionScheme {
            axis: self.axis,
            num_elems: self.num_elems[start..end].to_vec(),
            alignment: self.alignment,
        })
    }
}

impl SeUpsampling {
    pub fn new(factors: [u32; 2]) -> Self {
        SeUpsampling {
            factors,
            offsets: [0, 0],
            sizes: None,
        }
    }

    pub fn infer_output_shape(&self, data: &[DimSize]) -> Shape {
        let mut shape = Shape::from(data);
        for (i, dim) in [act::H, act::W].into_iter().enumerate() {
            shape[dim] = match self.sizes {
                Some(sizes) => sizes[i],
                None => data[dim] * self.factors[i],
            };
        }
        shape
    }

    pub fn back_infer_shape(&self, output: &[DimSize]) -> Shape {
        let mut shape = Shape::from(output);
        for (i, dim) in [act::H, act::W].into_iter().enumerate() {
            shape[dim] = div_ceil_u32(self.offsets[i] + output[dim], self.factors[i]);
        }
        shape
    }

    /// The attribute describing an upsampled tensor reshaped to `output`.
    pub fn resized(&self, output: &[DimSize]) -> Self {
        SeUpsampling {
            sizes: self.sizes.map(|_| [output[act::H], output[act::W]]),
            ..*self
        }
    }

    /// The stored-data region read when producing the output tile `region`, and the
    /// attribute of that tile.
    pub fn tile(&self, region: &Region) -> (Region, SeUpsampling) {
        let mut data_region = region.clone();
        let mut tile = *self;
        let mut sizes = [0; 2];
        for (i, dim) in [act::H, act::W].into_iter().enumerate() {
            let factor = self.factors[i];
            let begin = self.offsets[i] + region.offsets()[dim];
            let start = begin / factor;
            let end = div_ceil_u32(begin + region.shape()[dim], factor);
            data_region = data_region.with_dim(dim, start, end - start);
            tile.offsets[i] = begin - start * factor;
            sizes[i] = region.shape()[dim];
        }
        tile.sizes = Some(sizes);
        (data_region, tile)
    }
}

fn check_rank4(what: &'static str, shape: &[DimSize]) -> Result<(), SparseError> {
    if shape.len() != 4 {
        return Err(SparseError::NotRank4 {
            what,
            rank: shape.len(),
        });
    }
    Ok(())
}

/// `base` with its H and W taken from `spatial`.
fn with_spatial(base: &[DimSize], spatial: &[DimSize]) -> Shape {
    let mut shape = Shape::from(base);
    shape[act::H] = spatial[act::H];
    shape[act::W] = spatial[act::W];
    shape
}
