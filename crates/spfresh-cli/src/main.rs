#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::too_many_lines)]

//! Experiment driver (§6 EXTERNAL INTERFACES "Command-line driver"):
//! builds (or reopens) an index from a vector file or a seeded random
//! batch, runs N batches of inserts, and optionally reports recall/QPS
//! over a query file, behind a `clap::Parser` derive for argument
//! handling.

mod report;
mod vectors;

use clap::Parser;
use report::QueryOutcome;
use spfresh_core::{EngineConfig, Metric, SpfreshError, ValueType};
use spfresh_engine::{Engine, SearchOptions};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ValueTypeArg {
    Float,
    Int8,
    Int16,
    UInt8,
}

impl From<ValueTypeArg> for ValueType {
    fn from(v: ValueTypeArg) -> Self {
        match v {
            ValueTypeArg::Float => ValueType::Float,
            ValueTypeArg::Int8 => ValueType::Int8,
            ValueTypeArg::Int16 => ValueType::Int16,
            ValueTypeArg::UInt8 => ValueType::UInt8,
        }
    }
}

/// Billion-scale freshness-engine experiment driver.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Vector dimension.
    #[arg(long)]
    dim: usize,

    /// Vectors per batch, used when generating random data (required
    /// unless `--db-vectors` supplies them).
    #[arg(long)]
    count: Option<usize>,

    /// Number of batches: the first builds the index, the rest add to it.
    #[arg(long, default_value_t = 1)]
    batches: usize,

    /// Raw `dim * T` vector file (no header) to build/add from.
    #[arg(long)]
    db_vectors: Option<PathBuf>,

    /// Raw `dim * T` query vector file (no header).
    #[arg(long)]
    query_vectors: Option<PathBuf>,

    /// Number of query vectors to read from `--query-vectors`.
    #[arg(long)]
    query_count: Option<usize>,

    /// Comma-separated result sizes for reporting, e.g. `10,50,100`.
    #[arg(long, value_delimiter = ',', default_value = "10")]
    k: Vec<usize>,

    /// Worker threads: both the append-worker pool size and the query
    /// fan-out width.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Mapping + persistent-buffer root.
    #[arg(long, default_value = "./experiment_index")]
    index_dir: PathBuf,

    /// Block-device mapping file path.
    #[arg(long)]
    spdk_map: PathBuf,

    /// Element type of the vector files.
    #[arg(long, value_enum, default_value_t = ValueTypeArg::Float)]
    value_type: ValueTypeArg,

    /// Head-selection ratio, forwarded to `EngineConfig` as an advisory
    /// hint for the (external) head builder.
    #[arg(long, default_value_t = 0.1)]
    ratio: f32,

    #[arg(long, default_value_t = 8)]
    replica_count: usize,

    #[arg(long, default_value_t = 3)]
    posting_page_limit: usize,

    #[arg(long, default_value_t = 10)]
    merge_threshold: usize,

    /// Defaults to `18 * replica_count` when unset (§9 open question).
    #[arg(long)]
    split_threshold: Option<usize>,

    #[arg(long, default_value_t = 10_000.0)]
    max_dist_ratio: f32,

    #[arg(long, default_value_t = 64)]
    search_internal_result_num: usize,

    /// Seed for randomly generated batches/queries.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Block-device capacity, in 4 KiB blocks.
    #[arg(long, default_value_t = 1 << 24)]
    capacity_blocks: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run(Args::parse()) {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), SpfreshError> {
    if args.dim == 0 {
        return Err(SpfreshError::DimensionMismatch {
            expected: 1,
            actual: 0,
        });
    }
    if args.db_vectors.is_none() && args.count.is_none() {
        return Err(SpfreshError::Corrupted(
            "one of --count or --db-vectors is required".into(),
        ));
    }

    let value_type: ValueType = args.value_type.into();
    let metric = Metric::L2;
    let replica_count = args.replica_count.max(1);
    let split_threshold = args.split_threshold.unwrap_or(18 * replica_count);

    let config = EngineConfig::new(replica_count);
    config.set_posting_page_limit(args.posting_page_limit);
    config.set_merge_threshold(args.merge_threshold);
    config.set_split_threshold(split_threshold);
    config.set_max_dist_ratio(args.max_dist_ratio);
    config.set_search_internal_result_num(args.search_internal_result_num);
    config.set_head_ratio(args.ratio);
    config.set_append_workers(args.threads);

    let engine = Engine::open(
        &args.index_dir,
        &args.spdk_map,
        args.dim,
        value_type,
        metric,
        args.capacity_blocks,
        config,
    )?;

    let db_batches = load_batches(&args, value_type)?;
    for (batch_idx, batch) in db_batches.iter().enumerate() {
        let start = Instant::now();
        let vids = engine.insert_batch(batch.clone())?;
        engine.drain();
        tracing::info!(
            batch = batch_idx,
            inserted = vids.len(),
            elapsed = ?start.elapsed(),
            "batch complete"
        );
    }

    if let Some(query_path) = &args.query_vectors {
        run_queries(&engine, &args, query_path, value_type)?;
    }

    engine.shutdown()
}

/// Build the per-batch vector lists: slices of `--db-vectors` when
/// given, else `--batches` independent seeded-random draws of `--count`
/// vectors each (§6 "--batches N; first builds, subsequent add").
fn load_batches(args: &Args, value_type: ValueType) -> Result<Vec<Vec<Vec<f32>>>, SpfreshError> {
    if let Some(path) = &args.db_vectors {
        let max = args.count.map(|c| c * args.batches);
        let all = vectors::read_raw(path, args.dim, value_type, max)?;
        let per_batch = args.count.unwrap_or_else(|| {
            (all.len() / args.batches.max(1)).max(1)
        });
        Ok(all
            .chunks(per_batch)
            .take(args.batches.max(1))
            .map(<[Vec<f32>]>::to_vec)
            .collect())
    } else {
        let count = args.count.unwrap_or(0);
        Ok((0..args.batches.max(1))
            .map(|b| vectors::generate(args.dim, count, args.seed.wrapping_add(b as u64)))
            .collect())
    }
}

fn run_queries(
    engine: &Engine,
    args: &Args,
    query_path: &PathBuf,
    value_type: ValueType,
) -> Result<(), SpfreshError> {
    let queries = vectors::read_raw(query_path, args.dim, value_type, args.query_count)?;
    if queries.is_empty() {
        return Ok(());
    }
    let max_k = args.k.iter().copied().max().unwrap_or(10);
    let opts = SearchOptions {
        internal_result_num: Some(args.search_internal_result_num),
    };

    let thread_count = args.threads.max(1).min(queries.len());
    let chunk_size = queries.len().div_ceil(thread_count);
    let wall_start = Instant::now();

    let outcomes: Vec<QueryOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = queries
            .chunks(chunk_size)
            .enumerate()
            .map(|(chunk_idx, chunk)| {
                let base_idx = chunk_idx * chunk_size;
                scope.spawn(move || {
                    chunk
                        .iter()
                        .enumerate()
                        .map(|(offset, query)| {
                            let t0 = Instant::now();
                            let hits = engine.search(query, max_k, &opts).unwrap_or_default();
                            QueryOutcome {
                                query_idx: base_idx + offset,
                                latency: t0.elapsed(),
                                hits,
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    let wall_time = wall_start.elapsed();

    let mut outcomes = outcomes;
    outcomes.sort_by_key(|o| o.query_idx);

    report::print_latency_stats("query latency", &outcomes, wall_time);
    for k in &args.k {
        report::print_results_at_k("search results", *k, &outcomes);
    }
    Ok(())
}
