//! Splitting one sequence's cache history into independently processed chunks.

use pagoda_core::{PagodaError, Result};

/// Largest chunk size the heuristic starts from, in tokens.
pub const MAX_CHUNK_TOKENS: usize = 2048;
/// The heuristic never halves below this size.
pub const MIN_CHUNK_TOKENS: usize = 64;

/// A contiguous, block-aligned range of a sequence's tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// Logical index of the chunk's first block in the sequence block table.
    pub first_block: usize,
    pub num_blocks: usize,
    /// First token of the chunk.
    pub start: usize,
    pub len: usize,
}

impl Chunk {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// The part of the sequence block table this chunk starts at. The slice
    /// runs to the end of the table so the legacy iteration bound can read
    /// the entry after the chunk's last block.
    pub fn block_table<'t>(&self, table: &'t [usize]) -> &'t [usize] {
        &table[self.first_block..]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    seq_len: usize,
    block_size: usize,
    chunks: Vec<Chunk>,
}

impl ChunkPlan {
    /// A single chunk covering the whole sequence.
    pub fn whole(seq_len: usize, block_size: usize) -> Result<Self> {
        Self::from_boundaries(seq_len, block_size, &[])
    }

    /// Chunks of `chunk_tokens` tokens; the last one takes the remainder.
    pub fn fixed(seq_len: usize, block_size: usize, chunk_tokens: usize) -> Result<Self> {
        if chunk_tokens == 0 {
            return Err(PagodaError::InvalidArgument("chunk size must be non-zero".into()));
        }
        let boundaries: Vec<usize> = (chunk_tokens..seq_len).step_by(chunk_tokens).collect();
        Self::from_boundaries(seq_len, block_size, &boundaries)
    }

    /// Chunks starting at token 0 and at every entry of `boundaries`.
    ///
    /// Boundaries must be strictly increasing, inside `(0, seq_len)` and
    /// multiples of `block_size`.
    pub fn from_boundaries(seq_len: usize, block_size: usize, boundaries: &[usize]) -> Result<Self> {
        if seq_len == 0 || block_size == 0 {
            return Err(PagodaError::InvalidArgument(format!(
                "cannot plan chunks for seq_len={seq_len}, block_size={block_size}"
            )));
        }
        let mut starts = Vec::with_capacity(boundaries.len() + 1);
        starts.push(0);
        for &b in boundaries {
            if b % block_size != 0 {
                return Err(PagodaError::InvalidArgument(format!(
                    "chunk boundary {b} is not a multiple of block size {block_size}"
                )));
            }
            if b == 0 || b >= seq_len || b <= *starts.last().unwrap_or(&0) {
                return Err(PagodaError::InvalidArgument(format!(
                    "chunk boundary {b} out of order or outside (0, {seq_len})"
                )));
            }
            starts.push(b);
        }

        let chunks = starts
            .iter()
            .enumerate()
            .map(|(index, &start)| {
                let end = starts.get(index + 1).copied().unwrap_or(seq_len);
                let len = end - start;
                Chunk {
                    index,
                    first_block: start / block_size,
                    num_blocks: len.div_ceil(block_size),
                    start,
                    len,
                }
            })
            .collect();

        Ok(Self {
            seq_len,
            block_size,
            chunks,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Tokens in the longest chunk; sizes the score buffer of a workspace
    /// reused across chunks.
    pub fn max_chunk_len(&self) -> usize {
        self.chunks.iter().map(|c| c.len).max().unwrap_or(0)
    }
}

/// Picks a chunk size for the decode sequences of one batch.
///
/// Starts at [`MAX_CHUNK_TOKENS`] and halves while the batch would produce
/// fewer than 1024 (kv-head, chunk) work items, the halved size stays at or
/// above [`MIN_CHUNK_TOKENS`], and the longest sequence would not need more
/// than 128 chunks.
pub fn choose_chunk_tokens(num_kv_heads: usize, sum_decode_tokens: usize, max_decode_tokens: usize) -> usize {
    let mut size = MAX_CHUNK_TOKENS;
    while (num_kv_heads as f64) * (sum_decode_tokens as f64 / size as f64) < 1024.0
        && size / 2 >= MIN_CHUNK_TOKENS
        && max_decode_tokens as f64 / (size / 2) as f64 <= 128.0
    {
        size /= 2;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_plan_takes_remainder_in_last_chunk() {
        let plan = ChunkPlan::fixed(11, 2, 4).unwrap();
        let spans: Vec<(usize, usize, usize, usize)> = plan
            .chunks()
            .iter()
            .map(|c| (c.start, c.len, c.first_block, c.num_blocks))
            .collect();
        assert_eq!(spans, vec![(0, 4, 0, 2), (4, 4, 2, 2), (8, 3, 4, 2)]);
        assert_eq!(plan.max_chunk_len(), 4);
    }

    #[test]
    fn chunks_cover_sequence_exactly() {
        let plan = ChunkPlan::from_boundaries(23, 1, &[6, 7, 17]).unwrap();
        let mut next = 0;
        for (i, c) in plan.chunks().iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.start, next);
            next = c.end();
        }
        assert_eq!(next, 23);
    }

    #[test]
    fn whole_plan_is_single_chunk() {
        let plan = ChunkPlan::whole(5, 4).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks()[0].num_blocks, 2);
    }

    #[test]
    fn rejects_bad_boundaries() {
        assert!(ChunkPlan::from_boundaries(16, 4, &[6]).is_err());
        assert!(ChunkPlan::from_boundaries(16, 4, &[8, 4]).is_err());
        assert!(ChunkPlan::from_boundaries(16, 4, &[16]).is_err());
        assert!(ChunkPlan::fixed(16, 4, 0).is_err());
        assert!(ChunkPlan::whole(0, 4).is_err());
    }

    #[test]
    fn chunk_table_starts_at_first_block() {
        let plan = ChunkPlan::fixed(8, 2, 4).unwrap();
        let table = [9, 3, 7, 1];
        assert_eq!(plan.chunks()[1].block_table(&table), &[7, 1]);
    }

    #[test]
    fn chunk_size_heuristic() {
        // tiny batch: shrink to the floor
        assert_eq!(choose_chunk_tokens(8, 100, 100), MIN_CHUNK_TOKENS);
        // plenty of work already: keep the largest size
        assert_eq!(choose_chunk_tokens(8, 1 << 20, 4096), MAX_CHUNK_TOKENS);
        // a very long sequence stops halving before exceeding 128 chunks
        assert_eq!(choose_chunk_tokens(1, 32768, 32768), 256);
    }
}
