//! Pagoda driver: decode attention over a synthetic paged KV cache.
//!
//! Fills a cache with seeded random history, runs the whole-sequence forward
//! pass and the chunked pass (chunks in parallel, then merged) and reports
//! how closely they agree.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use clap::builder::{PossibleValuesParser, TypedValueParser};
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use pagoda_core::{Accumulator, DType, Element, EngineConfig, IterationBound};
use pagoda_kernels::{ChunkPlan, DecodeArgs, PagedAttention, Workspace, choose_chunk_tokens};
use pagoda_kvcache::PagedKvStore;

const SEQ_ID: u64 = 0;

#[derive(Parser)]
#[command(name = "pagoda", about = "Paged decode attention over a synthetic KV cache")]
struct Cli {
    /// Engine config JSON; built-in defaults are used when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tokens of cached history to attend over
    #[arg(long, default_value = "4000")]
    seq_len: usize,

    /// Tokens per chunk, rounded up to a block multiple. Picked from the
    /// sequence shape when absent
    #[arg(long)]
    chunk_tokens: Option<usize>,

    /// Softmax scale (default 1/sqrt(head_dim))
    #[arg(long)]
    scale: Option<f32>,

    /// Seed for the random cache contents and query
    #[arg(long, default_value = "0")]
    seed: u64,

    #[arg(long)]
    num_heads: Option<usize>,

    #[arg(long)]
    num_kv_heads: Option<usize>,

    #[arg(long)]
    head_dim: Option<usize>,

    #[arg(long)]
    block_size: Option<usize>,

    /// Cache storage type
    #[arg(long, value_parser = dtype_parser())]
    cache_dtype: Option<DType>,

    /// Visit `seq_len / block_size + 1` blocks instead of the exact count
    #[arg(long)]
    legacy_bound: bool,
}

fn dtype_parser() -> impl TypedValueParser<Value = DType> {
    PossibleValuesParser::new(["f64", "f32", "f16", "bf16"]).try_map(|s| s.parse::<DType>())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.check_seq_len(cli.seq_len)?;

    let g = config.geometry()?;
    info!(
        "Geometry: {} query heads, {} KV heads, head_dim {}, block_size {}, {:?} cache, {:?} bound",
        g.num_q_heads(),
        g.num_kv_heads(),
        g.head_dim(),
        g.block_size(),
        config.cache_dtype,
        config.iteration_bound,
    );

    match config.cache_dtype {
        DType::F64 => run::<f64, f64>(&config, &cli),
        DType::F32 => run::<f32, f32>(&config, &cli),
        DType::F16 => run::<f16, f32>(&config, &cli),
        DType::BF16 => run::<bf16, f32>(&config, &cli),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig {
            num_attention_heads: 32,
            num_key_value_heads: Some(8),
            head_dim: 128,
            num_layers: 1,
            block_size: 16,
            num_blocks: 1024,
            max_blocks_per_seq: 512,
            iteration_bound: IterationBound::Exact,
            cache_dtype: DType::F32,
            softmax_scale: None,
        },
    };

    if let Some(n) = cli.num_heads {
        config.num_attention_heads = n;
    }
    if let Some(n) = cli.num_kv_heads {
        config.num_key_value_heads = Some(n);
    }
    if let Some(d) = cli.head_dim {
        config.head_dim = d;
    }
    if let Some(b) = cli.block_size {
        config.block_size = b;
    }
    if let Some(dtype) = cli.cache_dtype {
        config.cache_dtype = dtype;
    }
    if cli.legacy_bound {
        config.iteration_bound = IterationBound::Legacy;
    }
    if cli.scale.is_some() {
        config.softmax_scale = cli.scale;
    }

    anyhow::ensure!(config.num_layers > 0, "config must have at least one layer");
    config.num_blocks = config.num_blocks.max(cli.seq_len.div_ceil(config.block_size));
    Ok(config)
}

fn run<S, A>(config: &EngineConfig, cli: &Cli) -> anyhow::Result<()>
where
    S: Element,
    A: Accumulator + From<S>,
{
    let g = config.geometry()?;
    let seq_len = cli.seq_len;
    let layer = config.num_layers - 1;
    let mut rng = StdRng::seed_from_u64(cli.seed);

    // --- Fill the cache ---
    let start = Instant::now();
    let mut store = PagedKvStore::<S>::new(g, config.num_layers, config.num_blocks);
    store.allocate(SEQ_ID)?;
    for _ in 0..seq_len {
        for l in 0..config.num_layers {
            let keys = random_vec::<S>(&mut rng, g.kv_dim());
            let values = random_vec::<S>(&mut rng, g.kv_dim());
            store.append(SEQ_ID, l, &keys, &values)?;
        }
    }
    let query = random_vec::<S>(&mut rng, g.q_len());
    let usage = store.usage();
    info!(
        "Cache filled in {:.2?}: {} tokens in {}/{} blocks ({:.1}% used)",
        start.elapsed(),
        seq_len,
        usage.used_blocks,
        usage.total_blocks,
        usage.usage_ratio() * 100.0,
    );

    let block_table = match config.iteration_bound {
        IterationBound::Exact => store.block_table(SEQ_ID)?,
        IterationBound::Legacy => store.padded_block_table(SEQ_ID)?,
    };
    let view = store.view()?;
    let attn = PagedAttention::with_bound(g, config.iteration_bound);
    let args = DecodeArgs {
        query: &query,
        block_table: &block_table,
        layer,
        seq_len,
        softmax_scale: config.softmax_scale(),
    };

    // --- Whole sequence ---
    let start = Instant::now();
    let mut scores = vec![A::ZERO; g.scores_len(seq_len)];
    let mut acc = vec![A::ZERO; g.q_len()];
    let mut whole_out = vec![A::ZERO; g.q_len()];
    let mut whole_lse = vec![A::ZERO; g.num_q_heads()];
    attn.forward_checked(
        &args,
        &view,
        &mut Workspace::new(&mut scores, &mut acc),
        &mut whole_out,
        &mut whole_lse,
    )?;
    let whole_time = start.elapsed();

    // --- Chunked ---
    let bs = g.block_size();
    let chunk_tokens = cli
        .chunk_tokens
        .unwrap_or_else(|| choose_chunk_tokens(g.num_kv_heads(), seq_len, seq_len))
        .div_ceil(bs)
        * bs;
    let plan = ChunkPlan::fixed(seq_len, bs, chunk_tokens)?;
    debug!(chunk_tokens, num_chunks = plan.len(), "chunk plan");

    let start = Instant::now();
    let partials = plan
        .chunks()
        .par_iter()
        .map(|chunk| {
            let chunk_args = DecodeArgs {
                block_table: chunk.block_table(args.block_table),
                seq_len: chunk.len,
                ..args
            };
            let mut scores = vec![A::ZERO; g.scores_len(chunk.len)];
            let mut acc = vec![A::ZERO; g.q_len()];
            let mut out = vec![A::ZERO; g.q_len()];
            let mut lse = vec![A::ZERO; g.num_q_heads()];
            attn.forward_checked(
                &chunk_args,
                &view,
                &mut Workspace::new(&mut scores, &mut acc),
                &mut out,
                &mut lse,
            )?;
            Ok((out, lse))
        })
        .collect::<pagoda_core::Result<Vec<(Vec<A>, Vec<A>)>>>()?;

    let (partial_out, partial_lse): (Vec<A>, Vec<A>) = partials
        .into_iter()
        .fold((Vec::new(), Vec::new()), |(mut outs, mut lses), (out, lse)| {
            outs.extend(out);
            lses.extend(lse);
            (outs, lses)
        });
    let mut merged_out = vec![A::ZERO; g.q_len()];
    let mut merged_lse = vec![A::ZERO; g.num_q_heads()];
    attn.merge_checked(
        plan.len(),
        &partial_out,
        &partial_lse,
        &mut acc,
        &mut merged_out,
        &mut merged_lse,
    )?;
    let chunked_time = start.elapsed();

    info!(
        "Whole sequence: {:.2?}; {} chunks of {} tokens: {:.2?}",
        whole_time,
        plan.len(),
        chunk_tokens,
        chunked_time,
    );
    info!(
        "Max difference: output {:.3e}, log-sum-exp {:.3e}",
        max_abs_diff(&whole_out, &merged_out),
        max_abs_diff(&whole_lse, &merged_lse),
    );
    Ok(())
}

fn random_vec<T: Element>(rng: &mut StdRng, len: usize) -> Vec<T> {
    (0..len)
        .map(|_| T::from_f64(rng.gen_range(-1.0f64..1.0)))
        .collect()
}

fn max_abs_diff<A: Element>(a: &[A], b: &[A]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x.to_f64() - y.to_f64()).abs())
        .fold(0.0, f64::max)
}
