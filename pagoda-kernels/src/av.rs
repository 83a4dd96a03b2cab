//! Weighted-sum kernel: `out[h, :] = sum_t p[t, h] * v[t, kv(h), :]`.

use pagoda_core::{Accumulator, Element, Geometry, IterationBound, KvCacheView};

use crate::lanes::axpy;

#[derive(Debug, Clone, Copy)]
pub struct WeightedSumKernel {
    geometry: Geometry,
    bound: IterationBound,
}

impl WeightedSumKernel {
    pub fn new(geometry: Geometry, bound: IterationBound) -> Self {
        Self { geometry, bound }
    }

    /// Accumulates into `acc` (`num_q_heads * head_dim`, accumulation
    /// precision) and rounds the result into `out`. Neither buffer needs to
    /// be zeroed by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn run<S, A, O>(
        &self,
        probs: &[A],
        cache: &KvCacheView<'_, S>,
        block_table: &[usize],
        layer: usize,
        seq_len: usize,
        acc: &mut [A],
        out: &mut [O],
    ) where
        S: Element,
        A: Accumulator + From<S>,
        O: Element,
    {
        let g = &self.geometry;
        let head_dim = g.head_dim();
        let group = g.group_size();
        let num_q_heads = g.num_q_heads();
        let q_len = g.q_len();
        let visited = g.blocks_visited(seq_len, self.bound);

        let acc = &mut acc[..q_len];
        acc.fill(A::ZERO);

        for (i, &block_id) in block_table[..visited].iter().enumerate() {
            let valid = g.valid_in_block(i, seq_len);
            let first_token = i * g.block_size();

            for kv_head in 0..g.num_kv_heads() {
                let values = cache.value_block(layer, block_id, kv_head);
                let first_head = kv_head * group;
                let acc_group = &mut acc[first_head * head_dim..(first_head + group) * head_dim];

                for (slot, v) in values.chunks_exact(head_dim).take(valid).enumerate() {
                    let row = (first_token + slot) * num_q_heads + first_head;
                    for (j, acc_head) in acc_group.chunks_exact_mut(head_dim).enumerate() {
                        axpy(acc_head, probs[row + j], v);
                    }
                }
            }
        }

        for (o, &a) in out[..q_len].iter_mut().zip(acc.iter()) {
            *o = a.narrow();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn weighted_sum_over_two_blocks() {
        // 1 head, head_dim 2, block_size 2, seq_len 3 across blocks [1, 0]
        let g = Geometry::new(1, 1, 2, 2).unwrap();
        #[rustfmt::skip]
        let values = vec![
            100.0f32, 200.0,  0.0, 0.0, // block 0
            1.0, 2.0,         3.0, 4.0, // block 1
        ];
        let view = KvCacheView::new(&values, &values, g, 1, 2).unwrap();
        let probs = vec![0.5f32, 0.25, 0.25];
        let mut acc = vec![f32::NAN; 2];
        let mut out = vec![f32::NAN; 2];
        WeightedSumKernel::new(g, IterationBound::Exact)
            .run(&probs, &view, &[1, 0], 0, 3, &mut acc, &mut out);
        // 0.5*[1,2] + 0.25*[3,4] + 0.25*[100,200]
        assert_eq!(out, vec![26.25, 52.0]);
    }

    #[test]
    fn output_precision_differs_from_accumulation() {
        let g = Geometry::new(2, 1, 1, 4).unwrap();
        let values: Vec<bf16> = [1.0f32, 3.0, 0.0, 0.0].iter().map(|&x| bf16::from_f32(x)).collect();
        let view = KvCacheView::new(&values, &values, g, 1, 1).unwrap();
        // [t, h]: head 0 all on token 0, head 1 split evenly
        let probs = vec![1.0f64, 0.5, 0.0, 0.5];
        let mut acc = vec![0.0f64; 2];
        let mut out = vec![0.0f32; 2];
        WeightedSumKernel::new(g, IterationBound::Exact)
            .run(&probs, &view, &[0], 0, 2, &mut acc, &mut out);
        assert_eq!(out, vec![1.0, 2.0]);
    }
}
