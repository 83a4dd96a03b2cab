//! Chunk merger: recombines per-chunk softmax results with the log-sum-exp identity.
//!
//! A chunk whose scores were normalized on their own carries output `o_c` and
//! statistic `l_c = ln(sum_c) + max_c`. Over the union of chunks the true
//! weight of chunk `c` is `exp(l_c - m) / sum_k exp(l_k - m)` for any `m`;
//! taking `m = max_k l_k` keeps every exponent non-positive.

use pagoda_core::{Accumulator, Element, Geometry};
use tracing::trace;

use crate::lanes::axpy;

#[derive(Debug, Clone, Copy)]
pub struct MergeKernel {
    geometry: Geometry,
}

impl MergeKernel {
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry }
    }

    /// Merges `num_chunks` partial results.
    ///
    /// - `partial_out`: `[chunk, num_q_heads, head_dim]`, in any element type
    ///   that widens losslessly into `A`
    /// - `partial_lse`: `[chunk, num_q_heads]`
    /// - `acc`: `[num_q_heads, head_dim]` scratch in accumulation precision;
    ///   need not be zeroed
    /// - `out`: `[num_q_heads, head_dim]`, overwritten
    /// - `lse`: `[num_q_heads]`, receives the statistic of the union so merged
    ///   results can be merged again
    pub fn run<A, P, O>(
        &self,
        num_chunks: usize,
        partial_out: &[P],
        partial_lse: &[A],
        acc: &mut [A],
        out: &mut [O],
        lse: &mut [A],
    ) where
        A: Accumulator + From<P>,
        P: Element,
        O: Element,
    {
        let num_q_heads = self.geometry.num_q_heads();
        let head_dim = self.geometry.head_dim();
        let q_len = self.geometry.q_len();
        trace!(num_chunks, num_q_heads, head_dim, "merge attention chunks");

        let acc = &mut acc[..q_len];
        acc.fill(A::ZERO);

        for (h, acc_head) in acc.chunks_exact_mut(head_dim).enumerate() {
            let chunk_lse = |c: usize| partial_lse[c * num_q_heads + h];

            let max = (0..num_chunks).fold(A::NEG_INFINITY, |m, c| m.max(chunk_lse(c)));
            let mut sum = A::ZERO;
            for c in 0..num_chunks {
                sum += (chunk_lse(c) - max).exp();
            }

            for c in 0..num_chunks {
                let weight = (chunk_lse(c) - max).exp() / sum;
                let part = &partial_out[c * q_len + h * head_dim..c * q_len + (h + 1) * head_dim];
                axpy(acc_head, weight, part);
            }

            lse[h] = sum.ln() + max;
        }

        for (o, &a) in out[..q_len].iter_mut().zip(acc.iter()) {
            *o = a.narrow();
        }
    }
}
