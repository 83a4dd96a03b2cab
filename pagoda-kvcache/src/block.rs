use std::collections::HashMap;

use pagoda_core::{CacheUsage, PagodaError, Result};

/// Free-list allocator of physical cache blocks plus per-sequence block tables.
pub struct BlockManager {
    total_blocks: usize,
    block_size: usize,
    free_blocks: Vec<usize>,
    /// seq_id -> list of (block_id, fill_count)
    seq_blocks: HashMap<u64, Vec<(usize, usize)>>,
}

impl BlockManager {
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        Self {
            total_blocks,
            block_size,
            free_blocks: (0..total_blocks).rev().collect(),
            seq_blocks: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, num_blocks: usize) -> Result<Vec<usize>> {
        if self.free_blocks.len() < num_blocks {
            return Err(PagodaError::OutOfMemory(format!(
                "Need {} blocks, only {} free",
                num_blocks,
                self.free_blocks.len()
            )));
        }
        let split = self.free_blocks.len() - num_blocks;
        let mut blocks = self.free_blocks.split_off(split);
        blocks.reverse();
        Ok(blocks)
    }

    pub fn free(&mut self, blocks: &[usize]) {
        self.free_blocks.extend(blocks.iter().rev());
    }

    pub fn free_count(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn blocks_for(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    pub fn can_allocate(&self, num_tokens: usize) -> bool {
        self.free_blocks.len() >= self.blocks_for(num_tokens)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn usage(&self) -> CacheUsage {
        CacheUsage {
            total_blocks: self.total_blocks,
            used_blocks: self.total_blocks - self.free_blocks.len(),
            block_size: self.block_size,
        }
    }

    // Sequence-level operations

    /// Reserves blocks for `initial_tokens` tokens and marks them filled.
    /// An existing allocation for `seq_id` is released first.
    pub fn allocate_seq(&mut self, seq_id: u64, initial_tokens: usize) -> Result<()> {
        if let Some(old) = self.seq_blocks.remove(&seq_id) {
            let ids: Vec<usize> = old.into_iter().map(|(id, _)| id).collect();
            self.free(&ids);
        }
        let num_blocks = self.blocks_for(initial_tokens).max(1);
        let blocks = self.allocate(num_blocks)?;
        let mut remaining = initial_tokens;
        let seq_blocks = blocks
            .into_iter()
            .map(|b| {
                let fill = remaining.min(self.block_size);
                remaining -= fill;
                (b, fill)
            })
            .collect();
        self.seq_blocks.insert(seq_id, seq_blocks);
        Ok(())
    }

    pub fn free_seq(&mut self, seq_id: u64) -> Result<()> {
        let blocks = self
            .seq_blocks
            .remove(&seq_id)
            .ok_or(PagodaError::SeqNotFound(seq_id))?;
        let block_ids: Vec<usize> = blocks.into_iter().map(|(id, _)| id).collect();
        self.free(&block_ids);
        Ok(())
    }

    pub fn get_block_table(&self, seq_id: u64) -> Result<Vec<usize>> {
        let blocks = self
            .seq_blocks
            .get(&seq_id)
            .ok_or(PagodaError::SeqNotFound(seq_id))?;
        Ok(blocks.iter().map(|(id, _)| *id).collect())
    }

    /// Whether `num_tokens` more tokens fit into the sequence's last block
    /// plus the free list.
    pub fn can_append(&self, seq_id: u64, num_tokens: usize) -> Result<bool> {
        let blocks = self
            .seq_blocks
            .get(&seq_id)
            .ok_or(PagodaError::SeqNotFound(seq_id))?;
        let spare = blocks
            .last()
            .map_or(0, |&(_, fill)| self.block_size - fill);
        let needed = num_tokens.saturating_sub(spare).div_ceil(self.block_size);
        Ok(self.free_blocks.len() >= needed)
    }

    /// Claims the slot for one more token and returns `(block_id, slot)`.
    pub fn append_token(&mut self, seq_id: u64) -> Result<(usize, usize)> {
        let block_size = self.block_size;
        let blocks = self
            .seq_blocks
            .get_mut(&seq_id)
            .ok_or(PagodaError::SeqNotFound(seq_id))?;

        match blocks.last_mut() {
            Some((id, fill)) if *fill < block_size => {
                let slot = *fill;
                *fill += 1;
                Ok((*id, slot))
            }
            _ => {
                let new_block_id = self
                    .free_blocks
                    .pop()
                    .ok_or_else(|| PagodaError::OutOfMemory("No free blocks".into()))?;
                blocks.push((new_block_id, 1));
                Ok((new_block_id, 0))
            }
        }
    }

    pub fn seq_len(&self, seq_id: u64) -> Result<usize> {
        let blocks = self
            .seq_blocks
            .get(&seq_id)
            .ok_or(PagodaError::SeqNotFound(seq_id))?;
        Ok(blocks.iter().map(|(_, fill)| fill).sum())
    }
}
