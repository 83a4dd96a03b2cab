use crate::element::Element;
use crate::error::{PagodaError, Result};
use crate::geometry::Geometry;

/// Borrowed view over a paged key/value store.
///
/// Keys and values are each one contiguous region laid out as
/// `[layer, block, kv_head, slot, head_dim]`.
#[derive(Debug, Clone, Copy)]
pub struct KvCacheView<'a, T> {
    keys: &'a [T],
    values: &'a [T],
    geometry: Geometry,
    num_layers: usize,
    num_blocks: usize,
}

impl<'a, T: Element> KvCacheView<'a, T> {
    pub fn new(
        keys: &'a [T],
        values: &'a [T],
        geometry: Geometry,
        num_layers: usize,
        num_blocks: usize,
    ) -> Result<Self> {
        let expected = num_layers * num_blocks * geometry.block_len();
        if keys.len() != expected {
            return Err(PagodaError::ShapeMismatch {
                what: "key cache",
                expected,
                got: keys.len(),
            });
        }
        if values.len() != expected {
            return Err(PagodaError::ShapeMismatch {
                what: "value cache",
                expected,
                got: values.len(),
            });
        }
        Ok(Self {
            keys,
            values,
            geometry,
            num_layers,
            num_blocks,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    #[inline]
    fn layer_stride(&self) -> usize {
        self.num_blocks * self.geometry.block_len()
    }

    #[inline]
    fn head_block_range(&self, layer: usize, block_id: usize, kv_head: usize) -> std::ops::Range<usize> {
        let start = layer * self.layer_stride() + self.geometry.head_block_offset(block_id, kv_head);
        start..start + self.geometry.head_block_len()
    }

    /// Keys of one `(layer, block, kv_head)` tile: `[block_size, head_dim]`.
    #[inline]
    pub fn key_block(&self, layer: usize, block_id: usize, kv_head: usize) -> &'a [T] {
        &self.keys[self.head_block_range(layer, block_id, kv_head)]
    }

    /// Values of one `(layer, block, kv_head)` tile: `[block_size, head_dim]`.
    #[inline]
    pub fn value_block(&self, layer: usize, block_id: usize, kv_head: usize) -> &'a [T] {
        &self.values[self.head_block_range(layer, block_id, kv_head)]
    }

    pub fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.num_layers {
            return Err(PagodaError::LayerOutOfRange {
                layer,
                num_layers: self.num_layers,
            });
        }
        Ok(())
    }

    pub fn check_block_table(&self, block_table: &[usize]) -> Result<()> {
        match block_table.iter().find(|&&id| id >= self.num_blocks) {
            Some(&block_id) => Err(PagodaError::BlockOutOfRange {
                block_id,
                num_blocks: self.num_blocks,
            }),
            None => Ok(()),
        }
    }
}

pub struct CacheUsage {
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub block_size: usize,
}

impl CacheUsage {
    pub fn free_blocks(&self) -> usize {
        self.total_blocks.saturating_sub(self.used_blocks)
    }

    pub fn usage_ratio(&self) -> f32 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.used_blocks as f32 / self.total_blocks as f32
    }
}
