//! Sequence orchestrator: QK -> softmax -> AV for one decode query.

use pagoda_core::{
    Accumulator, Element, Geometry, IterationBound, KvCacheView, PagodaError, Result, ensure_len,
};
use tracing::trace;

use crate::av::WeightedSumKernel;
use crate::merge::MergeKernel;
use crate::plan::ChunkPlan;
use crate::qk::ScoreKernel;
use crate::softmax::SoftmaxKernel;

/// One query against one sequence's (or one chunk's) cache history.
#[derive(Debug, Clone, Copy)]
pub struct DecodeArgs<'a, S> {
    /// `[num_q_heads, head_dim]`
    pub query: &'a [S],
    /// Physical block ids in chronological order, starting at the first
    /// block of the processed range.
    pub block_table: &'a [usize],
    pub layer: usize,
    pub seq_len: usize,
    pub softmax_scale: f32,
}

/// Caller-owned scratch for one orchestrator call.
pub struct Workspace<'a, A> {
    /// `[seq_len, num_q_heads]`: raw scores, then probabilities.
    pub scores: &'a mut [A],
    /// `[num_q_heads, head_dim]`: output accumulator in accumulation precision.
    pub acc: &'a mut [A],
}

impl<'a, A> Workspace<'a, A> {
    pub fn new(scores: &'a mut [A], acc: &'a mut [A]) -> Self {
        Self { scores, acc }
    }

    pub fn scores_len(geometry: &Geometry, seq_len: usize) -> usize {
        geometry.scores_len(seq_len)
    }

    pub fn acc_len(geometry: &Geometry) -> usize {
        geometry.q_len()
    }
}

/// Paged decode attention for a fixed geometry.
///
/// The stage order is fixed: softmax reads what QK wrote and AV reads what
/// softmax wrote, all through the same score buffer.
#[derive(Debug, Clone, Copy)]
pub struct PagedAttention {
    geometry: Geometry,
    bound: IterationBound,
    qk: ScoreKernel,
    softmax: SoftmaxKernel,
    av: WeightedSumKernel,
    merge: MergeKernel,
}

impl PagedAttention {
    pub fn new(geometry: Geometry) -> Self {
        Self::with_bound(geometry, IterationBound::Exact)
    }

    pub fn with_bound(geometry: Geometry, bound: IterationBound) -> Self {
        Self {
            geometry,
            bound,
            qk: ScoreKernel::new(geometry, bound),
            softmax: SoftmaxKernel::new(geometry),
            av: WeightedSumKernel::new(geometry, bound),
            merge: MergeKernel::new(geometry),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn bound(&self) -> IterationBound {
        self.bound
    }

    pub fn merger(&self) -> &MergeKernel {
        &self.merge
    }

    /// Runs the three stages. Buffers are only checked by slice indexing;
    /// use [`forward_checked`](Self::forward_checked) for validated input.
    ///
    /// Writes the attention output into `out` and the per-head log-sum-exp of
    /// the scaled scores into `lse`.
    pub fn forward<S, A, O>(
        &self,
        args: &DecodeArgs<'_, S>,
        cache: &KvCacheView<'_, S>,
        workspace: &mut Workspace<'_, A>,
        out: &mut [O],
        lse: &mut [A],
    ) where
        S: Element,
        A: Accumulator + From<S>,
        O: Element,
    {
        trace!(
            layer = args.layer,
            seq_len = args.seq_len,
            blocks = self.geometry.blocks_visited(args.seq_len, self.bound),
            "paged decode attention"
        );
        let scale = A::from_f64(f64::from(args.softmax_scale));

        self.qk.run(
            args.query,
            cache,
            args.block_table,
            args.layer,
            args.seq_len,
            &mut *workspace.scores,
        );
        self.softmax.run(&mut *workspace.scores, args.seq_len, scale, lse);
        self.av.run(
            &*workspace.scores,
            cache,
            args.block_table,
            args.layer,
            args.seq_len,
            &mut *workspace.acc,
            out,
        );
    }

    /// [`forward`](Self::forward) after validating every shape, the layer and
    /// each block id the kernels will dereference.
    pub fn forward_checked<S, A, O>(
        &self,
        args: &DecodeArgs<'_, S>,
        cache: &KvCacheView<'_, S>,
        workspace: &mut Workspace<'_, A>,
        out: &mut [O],
        lse: &mut [A],
    ) -> Result<()>
    where
        S: Element,
        A: Accumulator + From<S>,
        O: Element,
    {
        self.validate(args, cache)?;
        let g = &self.geometry;
        ensure_len("score buffer", g.scores_len(args.seq_len), workspace.scores.len())?;
        ensure_len("accumulator", g.q_len(), workspace.acc.len())?;
        ensure_len("output", g.q_len(), out.len())?;
        ensure_len("log-sum-exp", g.num_q_heads(), lse.len())?;
        self.forward(args, cache, workspace, out, lse);
        Ok(())
    }

    fn validate<S: Element>(&self, args: &DecodeArgs<'_, S>, cache: &KvCacheView<'_, S>) -> Result<()> {
        let g = &self.geometry;
        if cache.geometry() != g {
            return Err(PagodaError::InvalidGeometry(format!(
                "cache geometry {:?} differs from kernel geometry {g:?}",
                cache.geometry()
            )));
        }
        if args.seq_len == 0 {
            return Err(PagodaError::InvalidArgument(
                "attention over an empty history".into(),
            ));
        }
        if !args.softmax_scale.is_finite() {
            return Err(PagodaError::InvalidArgument(format!(
                "softmax scale {} is not finite",
                args.softmax_scale
            )));
        }
        ensure_len("query", g.q_len(), args.query.len())?;
        cache.check_layer(args.layer)?;
        let visited = g.blocks_visited(args.seq_len, self.bound);
        ensure_len("block table", visited, args.block_table.len())?;
        cache.check_block_table(&args.block_table[..visited])
    }

    /// Processes every chunk of `plan` independently and merges the results.
    ///
    /// `args` describes the whole sequence; `partial_out`
    /// (`[num_chunks, num_q_heads, head_dim]`) and `partial_lse`
    /// (`[num_chunks, num_q_heads]`) receive the per-chunk results in
    /// accumulation precision, so only the merged output is rounded to `O`.
    /// The workspace score buffer must fit the longest chunk.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_chunked<S, A, O>(
        &self,
        args: &DecodeArgs<'_, S>,
        cache: &KvCacheView<'_, S>,
        plan: &ChunkPlan,
        workspace: &mut Workspace<'_, A>,
        partial_out: &mut [A],
        partial_lse: &mut [A],
        out: &mut [O],
        lse: &mut [A],
    ) -> Result<()>
    where
        S: Element,
        A: Accumulator + From<S>,
        O: Element,
    {
        let g = &self.geometry;
        if plan.seq_len() != args.seq_len || plan.block_size() != g.block_size() {
            return Err(PagodaError::InvalidArgument(format!(
                "chunk plan for {} tokens / block size {} does not match sequence of {} tokens / block size {}",
                plan.seq_len(),
                plan.block_size(),
                args.seq_len,
                g.block_size()
            )));
        }
        let num_chunks = plan.len();
        ensure_len("partial outputs", num_chunks * g.q_len(), partial_out.len())?;
        ensure_len("partial log-sum-exp", num_chunks * g.num_q_heads(), partial_lse.len())?;

        for chunk in plan.chunks() {
            let chunk_args = DecodeArgs {
                block_table: chunk.block_table(args.block_table),
                seq_len: chunk.len,
                ..*args
            };
            let q_len = g.q_len();
            let heads = g.num_q_heads();
            self.forward_checked(
                &chunk_args,
                cache,
                workspace,
                &mut partial_out[chunk.index * q_len..(chunk.index + 1) * q_len],
                &mut partial_lse[chunk.index * heads..(chunk.index + 1) * heads],
            )?;
        }

        self.merge_checked(
            num_chunks,
            &*partial_out,
            &*partial_lse,
            &mut *workspace.acc,
            out,
            lse,
        )
    }

    /// Merges chunk results after validating buffer lengths. `acc` is
    /// `[num_q_heads, head_dim]` scratch in accumulation precision.
    pub fn merge_checked<A, P, O>(
        &self,
        num_chunks: usize,
        partial_out: &[P],
        partial_lse: &[A],
        acc: &mut [A],
        out: &mut [O],
        lse: &mut [A],
    ) -> Result<()>
    where
        A: Accumulator + From<P>,
        P: Element,
        O: Element,
    {
        let g = &self.geometry;
        if num_chunks == 0 {
            return Err(PagodaError::InvalidArgument("merge of zero chunks".into()));
        }
        ensure_len("partial outputs", num_chunks * g.q_len(), partial_out.len())?;
        ensure_len("partial log-sum-exp", num_chunks * g.num_q_heads(), partial_lse.len())?;
        ensure_len("accumulator", g.q_len(), acc.len())?;
        ensure_len("output", g.q_len(), out.len())?;
        ensure_len("log-sum-exp", g.num_q_heads(), lse.len())?;
        self.merge.run(num_chunks, partial_out, partial_lse, acc, out, lse);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hq=2, Hk=1, D=1, B=2, two physical blocks.
    fn setup() -> (Geometry, Vec<f64>, Vec<f64>) {
        let g = Geometry::new(2, 1, 1, 2).unwrap();
        let keys = vec![0.0, 1.0, 2.0, 3.0];
        let values = vec![10.0, 20.0, 30.0, 40.0];
        (g, keys, values)
    }

    #[test]
    fn workspace_lengths() {
        let (g, _, _) = setup();
        assert_eq!(Workspace::<f32>::scores_len(&g, 5), 10);
        assert_eq!(Workspace::<f32>::acc_len(&g), 2);
    }

    #[test]
    fn uniform_scores_average_values() {
        let (g, keys, values) = setup();
        let view = KvCacheView::new(&keys, &values, g, 1, 2).unwrap();
        let attn = PagedAttention::new(g);
        // A zero query gives every token the same weight.
        let query = [0.0, 0.0];
        let args = DecodeArgs {
            query: &query,
            block_table: &[1, 0],
            layer: 0,
            seq_len: 3,
            softmax_scale: 1.0,
        };
        let mut scores = vec![0.0; 6];
        let mut acc = vec![0.0; 2];
        let mut out = vec![0.0f32; 2];
        let mut lse = vec![0.0; 2];
        attn.forward_checked(&args, &view, &mut Workspace::new(&mut scores, &mut acc), &mut out, &mut lse)
            .unwrap();
        // Tokens are 30, 40, 10.
        let mean = (30.0 + 40.0 + 10.0) / 3.0;
        assert!(out.iter().all(|&o| (f64::from(o) - mean).abs() < 1e-5));
        assert!(lse.iter().all(|&l| (l - 3.0f64.ln()).abs() < 1e-12));
    }

    #[test]
    fn checked_forward_rejects_out_of_range_block() {
        let (g, keys, values) = setup();
        let view = KvCacheView::new(&keys, &values, g, 1, 2).unwrap();
        let attn = PagedAttention::new(g);
        let query = [1.0, 1.0];
        let args = DecodeArgs {
            query: &query,
            block_table: &[0, 2],
            layer: 0,
            seq_len: 4,
            softmax_scale: 1.0,
        };
        let mut scores = vec![0.0; 8];
        let mut acc = vec![0.0; 2];
        let mut out = vec![0.0; 2];
        let mut lse = vec![0.0; 2];
        let err = attn
            .forward_checked(&args, &view, &mut Workspace::new(&mut scores, &mut acc), &mut out, &mut lse)
            .unwrap_err();
        assert!(matches!(
            err,
            PagodaError::BlockOutOfRange { block_id: 2, num_blocks: 2 }
        ));
    }

    #[test]
    fn chunked_two_blocks_matches_whole() {
        let (g, keys, values) = setup();
        let view = KvCacheView::new(&keys, &values, g, 1, 2).unwrap();
        let attn = PagedAttention::new(g);
        let query = [0.5, -1.0];
        let args = DecodeArgs {
            query: &query,
            block_table: &[1, 0],
            layer: 0,
            seq_len: 4,
            softmax_scale: 1.0,
        };

        let mut scores = vec![0.0; 8];
        let mut acc = vec![0.0; 2];
        let mut whole = vec![0.0f64; 2];
        let mut whole_lse = vec![0.0; 2];
        attn.forward_checked(&args, &view, &mut Workspace::new(&mut scores, &mut acc), &mut whole, &mut whole_lse)
            .unwrap();

        let plan = ChunkPlan::fixed(4, 2, 2).unwrap();
        let mut partial_out = vec![0.0; 4];
        let mut partial_lse = vec![0.0; 4];
        let mut out = vec![0.0f64; 2];
        let mut lse = vec![0.0f64; 2];
        attn.forward_chunked(
            &args,
            &view,
            &plan,
            &mut Workspace::new(&mut scores, &mut acc),
            &mut partial_out,
            &mut partial_lse,
            &mut out,
            &mut lse,
        )
        .unwrap();
        for h in 0..2 {
            assert!((out[h] - whole[h]).abs() < 1e-12);
            assert!((lse[h] - whole_lse[h]).abs() < 1e-12);
        }
    }
}
