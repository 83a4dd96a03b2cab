//! Score kernel: raw `q . k` for every cached token and query head.

use pagoda_core::{Accumulator, Element, Geometry, IterationBound, KvCacheView};

use crate::lanes::{dot, dot2};

/// Key positions processed together so each query element is read once per tile.
pub const TILE: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct ScoreKernel {
    geometry: Geometry,
    bound: IterationBound,
}

impl ScoreKernel {
    pub fn new(geometry: Geometry, bound: IterationBound) -> Self {
        Self { geometry, bound }
    }

    /// Writes the unscaled score of token `t` for query head `h` at
    /// `scores[t * num_q_heads + h]`, for `t < seq_len`.
    ///
    /// `block_table` must hold at least `blocks_visited(seq_len)` valid ids.
    pub fn run<S, A>(
        &self,
        query: &[S],
        cache: &KvCacheView<'_, S>,
        block_table: &[usize],
        layer: usize,
        seq_len: usize,
        scores: &mut [A],
    ) where
        S: Element,
        A: Accumulator + From<S>,
    {
        let g = &self.geometry;
        let head_dim = g.head_dim();
        let group = g.group_size();
        let num_q_heads = g.num_q_heads();
        let visited = g.blocks_visited(seq_len, self.bound);

        for (i, &block_id) in block_table[..visited].iter().enumerate() {
            let valid = g.valid_in_block(i, seq_len);
            let first_token = i * g.block_size();

            for kv_head in 0..g.num_kv_heads() {
                let keys = cache.key_block(layer, block_id, kv_head);
                let q_group = &query[kv_head * group * head_dim..(kv_head + 1) * group * head_dim];
                let first_head = kv_head * group;

                let mut slot = 0;
                while slot + TILE <= valid {
                    let k0 = &keys[slot * head_dim..(slot + 1) * head_dim];
                    let k1 = &keys[(slot + 1) * head_dim..(slot + 2) * head_dim];
                    let row = (first_token + slot) * num_q_heads + first_head;
                    for (j, q) in q_group.chunks_exact(head_dim).enumerate() {
                        let (s0, s1) = dot2::<S, A>(q, k0, k1);
                        scores[row + j] = s0;
                        scores[row + num_q_heads + j] = s1;
                    }
                    slot += TILE;
                }

                if slot < valid {
                    let k = &keys[slot * head_dim..(slot + 1) * head_dim];
                    let row = (first_token + slot) * num_q_heads + first_head;
                    for (j, q) in q_group.chunks_exact(head_dim).enumerate() {
                        scores[row + j] = dot::<S, A>(q, k);
                    }
                }
            }
        }
    }
}
