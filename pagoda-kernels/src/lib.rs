//! Pagoda CPU kernels for single-query attention over a paged KV cache.
//!
//! The pipeline for one sequence is [`ScoreKernel`] -> [`SoftmaxKernel`] ->
//! [`WeightedSumKernel`], sequenced by [`PagedAttention`]. When a history is
//! split by a [`ChunkPlan`], each chunk runs the pipeline on its own and
//! [`MergeKernel`] recombines the partial outputs.
//!
//! Kernels never allocate: scores, accumulators, outputs and statistics are
//! borrowed from the caller.

pub mod attention;
pub mod av;
pub mod lanes;
pub mod merge;
pub mod plan;
pub mod qk;
pub mod softmax;

pub use attention::{DecodeArgs, PagedAttention, Workspace};
pub use av::WeightedSumKernel;
pub use merge::MergeKernel;
pub use plan::{Chunk, ChunkPlan, choose_chunk_tokens};
pub use qk::ScoreKernel;
pub use softmax::SoftmaxKernel;
