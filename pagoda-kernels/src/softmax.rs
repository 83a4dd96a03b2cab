//! Normalizer: in-place softmax over tokens, one distribution per query head.

use pagoda_core::{Accumulator, Geometry};

use crate::lanes::LANES;

#[derive(Debug, Clone, Copy)]
pub struct SoftmaxKernel {
    geometry: Geometry,
}

impl SoftmaxKernel {
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry }
    }

    /// Turns the raw scores of the first `seq_len` tokens into probabilities
    /// and writes `ln(sum(exp(scale * s - max))) + max` per head into `lse`.
    ///
    /// Heads are processed `LANES` at a time with the per-head max and sum
    /// held in lane registers, so no scratch memory is needed.
    pub fn run<A: Accumulator>(&self, scores: &mut [A], seq_len: usize, scale: A, lse: &mut [A]) {
        let num_q_heads = self.geometry.num_q_heads();
        let scores = &mut scores[..seq_len * num_q_heads];

        for head_start in (0..num_q_heads).step_by(LANES) {
            let width = LANES.min(num_q_heads - head_start);
            let heads = head_start..head_start + width;

            let mut max = [A::NEG_INFINITY; LANES];
            for row in scores.chunks_exact_mut(num_q_heads) {
                for (l, s) in row[heads.clone()].iter_mut().enumerate() {
                    *s = *s * scale;
                    max[l] = max[l].max(*s);
                }
            }

            let mut sum = [A::ZERO; LANES];
            for row in scores.chunks_exact_mut(num_q_heads) {
                for (l, s) in row[heads.clone()].iter_mut().enumerate() {
                    *s = (*s - max[l]).exp();
                    sum[l] += *s;
                }
            }

            for row in scores.chunks_exact_mut(num_q_heads) {
                for (l, s) in row[heads.clone()].iter_mut().enumerate() {
                    *s = *s / sum[l];
                }
            }

            for (l, out) in lse[heads].iter_mut().enumerate() {
                *out = sum[l].ln() + max[l];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_sum_to_one_per_head() {
        let g = Geometry::new(3, 1, 1, 1).unwrap();
        // [t, h] for 4 tokens x 3 heads
        let mut scores = vec![
            1.0f64, -3.0, 100.0, //
            2.0, -3.0, 0.0, //
            3.0, -3.0, -50.0, //
            4.0, -3.0, 7.0,
        ];
        let mut lse = vec![0.0f64; 3];
        SoftmaxKernel::new(g).run(&mut scores, 4, 1.0, &mut lse);

        for h in 0..3 {
            let total: f64 = (0..4).map(|t| scores[t * 3 + h]).sum();
            assert!((total - 1.0).abs() < 1e-12, "head {h} sums to {total}");
        }
        // head 1 is constant -> uniform
        for t in 0..4 {
            assert!((scores[t * 3 + 1] - 0.25).abs() < 1e-12);
        }
        assert!((lse[1] - (4.0f64.ln() - 3.0)).abs() < 1e-12);
    }

    #[test]
    fn more_heads_than_lanes() {
        let heads = LANES + 3;
        let g = Geometry::new(heads, 1, 1, 1).unwrap();
        let mut scores: Vec<f32> = (0..2 * heads).map(|i| i as f32 * 0.1).collect();
        let mut lse = vec![0.0f32; heads];
        SoftmaxKernel::new(g).run(&mut scores, 2, 2.0, &mut lse);
        for h in 0..heads {
            let total = scores[h] + scores[heads + h];
            assert!((total - 1.0).abs() < 1e-6);
            // scaled gap between the two tokens is 2.0 * 0.1 * heads
            let expected = 1.0 / (1.0 + (0.2 * heads as f32).exp());
            assert!((scores[h] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn large_scores_do_not_overflow() {
        let g = Geometry::new(1, 1, 1, 1).unwrap();
        let mut scores = vec![1000.0f32, 1001.0];
        let mut lse = vec![0.0f32];
        SoftmaxKernel::new(g).run(&mut scores, 2, 1.0, &mut lse);
        assert!(scores.iter().all(|p| p.is_finite()));
        assert!((lse[0] - (1001.0 + (1.0 + (-1.0f32).exp()).ln())).abs() < 1e-3);
    }
}
