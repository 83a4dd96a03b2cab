//! Paged KV store: block-organized K/V storage backed by [`BlockManager`].
//!
//! Keys and values each live in one contiguous region laid out as
//! `[layer, block, kv_head, slot, head_dim]`, the layout the attention
//! kernels read through [`KvCacheView`]. Tokens are appended as rows of
//! `num_kv_heads * head_dim` and scattered into their block slots.

use pagoda_core::{CacheUsage, Element, Geometry, KvCacheView, PagodaError, Result};
use tracing::debug;

use crate::block::BlockManager;

pub struct PagedKvStore<T> {
    geometry: Geometry,
    num_layers: usize,
    num_blocks: usize,
    keys: Vec<T>,
    values: Vec<T>,
    blocks: BlockManager,
}

impl<T: Element> PagedKvStore<T> {
    /// Create a store with `num_blocks` physical blocks per layer.
    pub fn new(geometry: Geometry, num_layers: usize, num_blocks: usize) -> Self {
        let len = num_layers * num_blocks * geometry.block_len();
        Self {
            geometry,
            num_layers,
            num_blocks,
            keys: vec![T::default(); len],
            values: vec![T::default(); len],
            blocks: BlockManager::new(num_blocks, geometry.block_size()),
        }
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

    /// Borrow the whole store for the attention kernels.
    pub fn view(&self) -> Result<KvCacheView<'_, T>> {
        KvCacheView::new(
            &self.keys,
            &self.values,
            self.geometry,
            self.num_layers,
            self.num_blocks,
        )
    }

    /// Start an empty sequence. An existing sequence with the same id is
    /// dropped first.
    pub fn allocate(&mut self, seq_id: u64) -> Result<()> {
        self.blocks.allocate_seq(seq_id, 0)?;
        debug!(seq_id, free = self.blocks.free_count(), "allocated sequence");
        Ok(())
    }

    /// Append `rows` tokens of K/V (`[rows, num_kv_heads * head_dim]`) for
    /// `layer`.
    ///
    /// Layer 0 claims new slots and advances the sequence length; other
    /// layers write the same slots layer 0 claimed last.
    pub fn append(&mut self, seq_id: u64, layer: usize, keys: &[T], values: &[T]) -> Result<()> {
        if layer >= self.num_layers {
            return Err(PagodaError::LayerOutOfRange {
                layer,
                num_layers: self.num_layers,
            });
        }
        let kv_dim = self.geometry.kv_dim();
        if keys.len() % kv_dim != 0 || keys.len() != values.len() {
            return Err(PagodaError::InvalidArgument(format!(
                "K/V rows must be multiples of kv_dim {kv_dim} (got {} keys, {} values)",
                keys.len(),
                values.len()
            )));
        }
        let rows = keys.len() / kv_dim;

        let slots: Vec<(usize, usize)> = if layer == 0 {
            if !self.blocks.can_append(seq_id, rows)? {
                return Err(PagodaError::OutOfMemory(format!(
                    "sequence {seq_id} cannot take {rows} more tokens ({} free blocks)",
                    self.blocks.free_count()
                )));
            }
            (0..rows)
                .map(|_| self.blocks.append_token(seq_id))
                .collect::<Result<_>>()?
        } else {
            let seq_len = self.blocks.seq_len(seq_id)?;
            if rows > seq_len {
                return Err(PagodaError::InvalidArgument(format!(
                    "layer {layer} writes {rows} tokens but sequence {seq_id} holds {seq_len}"
                )));
            }
            let table = self.blocks.get_block_table(seq_id)?;
            let bs = self.geometry.block_size();
            (seq_len - rows..seq_len)
                .map(|pos| (table[pos / bs], pos % bs))
                .collect()
        };

        for (row, &(block_id, slot)) in slots.iter().enumerate() {
            let src = row * kv_dim..(row + 1) * kv_dim;
            self.write_token(layer, block_id, slot, &keys[src.clone()], &values[src]);
        }
        Ok(())
    }

    fn write_token(&mut self, layer: usize, block_id: usize, slot: usize, key_row: &[T], value_row: &[T]) {
        let g = self.geometry;
        let head_dim = g.head_dim();
        let layer_base = layer * self.num_blocks * g.block_len();
        for kv_head in 0..g.num_kv_heads() {
            let dst = layer_base + g.head_block_offset(block_id, kv_head) + slot * head_dim;
            let src = kv_head * head_dim..(kv_head + 1) * head_dim;
            self.keys[dst..dst + head_dim].copy_from_slice(&key_row[src.clone()]);
            self.values[dst..dst + head_dim].copy_from_slice(&value_row[src]);
        }
    }

    /// Gather a sequence's K/V for `layer` into contiguous
    /// `[seq_len, num_kv_heads * head_dim]` buffers.
    pub fn gather(&self, seq_id: u64, layer: usize) -> Result<(Vec<T>, Vec<T>)> {
        if layer >= self.num_layers {
            return Err(PagodaError::LayerOutOfRange {
                layer,
                num_layers: self.num_layers,
            });
        }
        let seq_len = self.blocks.seq_len(seq_id)?;
        let table = self.blocks.get_block_table(seq_id)?;
        let view = self.view()?;
        let g = self.geometry;
        let head_dim = g.head_dim();

        let mut keys = Vec::with_capacity(seq_len * g.kv_dim());
        let mut values = Vec::with_capacity(seq_len * g.kv_dim());
        for pos in 0..seq_len {
            let block_id = table[pos / g.block_size()];
            let slot = pos % g.block_size();
            for kv_head in 0..g.num_kv_heads() {
                let row = slot * head_dim..(slot + 1) * head_dim;
                keys.extend_from_slice(&view.key_block(layer, block_id, kv_head)[row.clone()]);
                values.extend_from_slice(&view.value_block(layer, block_id, kv_head)[row]);
            }
        }
        Ok((keys, values))
    }

    pub fn block_table(&self, seq_id: u64) -> Result<Vec<usize>> {
        self.blocks.get_block_table(seq_id)
    }

    /// Block table with one trailing entry for the legacy iteration bound,
    /// which reads `seq_len / block_size + 1` entries. The extra entry
    /// repeats the last block and is never used for any position.
    pub fn padded_block_table(&self, seq_id: u64) -> Result<Vec<usize>> {
        let mut table = self.blocks.get_block_table(seq_id)?;
        let last = *table.last().ok_or(PagodaError::SeqNotFound(seq_id))?;
        table.push(last);
        Ok(table)
    }

    pub fn seq_len(&self, seq_id: u64) -> Result<usize> {
        self.blocks.seq_len(seq_id)
    }

    pub fn free(&mut self, seq_id: u64) -> Result<()> {
        self.blocks.free_seq(seq_id)?;
        debug!(seq_id, free = self.blocks.free_count(), "freed sequence");
        Ok(())
    }

    pub fn usage(&self) -> CacheUsage {
        self.blocks.usage()
    }

    pub fn can_allocate(&self, num_tokens: usize) -> bool {
        self.blocks.can_allocate(num_tokens)
    }
}
