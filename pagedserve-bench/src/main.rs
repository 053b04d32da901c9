use std::{
    collections::BTreeMap,
    fmt::Display,
    path::PathBuf,
    time::{Duration, Instant},
};

use candle_core::Device;
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use pagedserve_core::{
    initialize_logging, pipeline::ShadowExecutor, Engine, EngineConfig, NewRequest,
    PreemptionMode, Response, SamplingParams,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML engine configuration. Flags below override its cache and scheduler settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Integer seed to ensure a reproducible workload.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Number of requests in the workload.
    #[arg(long, short = 'n', default_value_t = 64)]
    num_requests: usize,

    /// Shortest prompt, in tokens.
    #[arg(long, default_value_t = 16)]
    min_prompt: usize,

    /// Longest prompt, in tokens.
    #[arg(long, default_value_t = 256)]
    max_prompt: usize,

    /// Number of tokens generated per sequence.
    #[arg(long, short = 'g', default_value_t = 64)]
    n_gen: usize,

    /// Fraction of requests sampling several sequences from one prompt.
    #[arg(long, default_value_t = 0.1)]
    parallel_fraction: f64,

    /// Fraction of requests carrying an encoder prompt.
    #[arg(long, default_value_t = 0.1)]
    encoder_fraction: f64,

    /// Tokens per KV cache block.
    #[arg(long)]
    block_size: Option<usize>,

    /// GPU block counts to compare. The first one is the reference run.
    #[arg(long, value_delimiter = ',', default_values_t = vec![4096, 256])]
    gpu_blocks: Vec<usize>,

    #[arg(long)]
    cpu_blocks: Option<usize>,

    /// Preemption modes to compare: auto, swap or recompute.
    #[arg(long, value_delimiter = ',', default_values_t = vec![PreemptionMode::Auto])]
    preemption: Vec<PreemptionMode>,
}

struct WorkloadItem {
    prompt: Vec<u32>,
    encoder_prompt: Option<Vec<u32>>,
    n: usize,
}

fn workload(args: &Args) -> Vec<WorkloadItem> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    (0..args.num_requests)
        .map(|_| {
            let len = rng.gen_range(args.min_prompt..=args.max_prompt.max(args.min_prompt));
            let prompt = (0..len).map(|_| rng.gen_range(0..32_000)).collect();
            let encoder_prompt = rng.gen_bool(args.encoder_fraction).then(|| {
                let len = rng.gen_range(args.min_prompt..=args.max_prompt.max(args.min_prompt));
                (0..len).map(|_| rng.gen_range(0..32_000)).collect()
            });
            let n = if rng.gen_bool(args.parallel_fraction) {
                rng.gen_range(2..=4)
            } else {
                1
            };
            WorkloadItem {
                prompt,
                encoder_prompt,
                n,
            }
        })
        .collect()
}

struct BenchResult {
    preemption: PreemptionMode,
    gpu_blocks: usize,
    steps: usize,
    preempted: usize,
    generated: usize,
    rejected: usize,
    elapsed: Duration,
    outputs: BTreeMap<usize, Vec<Vec<u32>>>,
}

struct Matches(Option<bool>);

impl Display for Matches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            None => write!(f, "reference"),
            Some(true) => write!(f, "yes"),
            Some(false) => write!(f, "NO"),
        }
    }
}

fn collect(rx: &mut Receiver<Response>) -> (BTreeMap<usize, Vec<Vec<u32>>>, usize) {
    let mut outputs = BTreeMap::new();
    let mut rejected = 0;
    while let Ok(response) = rx.try_recv() {
        match response {
            Response::Done(output) => {
                let mut generated: Vec<Vec<u32>> = output
                    .sequences
                    .into_iter()
                    .map(|seq| seq.generated)
                    .collect();
                generated.sort();
                outputs.insert(output.request_id, generated);
            }
            Response::Rejected(reason) => {
                warn!("{reason}");
                rejected += 1;
            }
            Response::Aborted(id) => warn!("Request {id} was aborted"),
            Response::ModelError(e) => warn!("Model error: {e}"),
        }
    }
    (outputs, rejected)
}

async fn submit(
    engine: &mut Engine<ShadowExecutor>,
    items: &[WorkloadItem],
    n_gen: usize,
    tx: &Sender<Response>,
) {
    for (request_id, item) in items.iter().enumerate() {
        let request = NewRequest {
            request_id,
            prompt: item.prompt.clone(),
            encoder_prompt: item.encoder_prompt.clone(),
            sampling: SamplingParams {
                n: item.n,
                ..SamplingParams::deterministic(n_gen)
            },
            priority: 0,
            responder: tx.clone(),
        };
        // Refusals arrive as `Response::Rejected`.
        let _ = engine.add_request(request).await;
    }
}

async fn run_bench(
    mut config: EngineConfig,
    items: &[WorkloadItem],
    n_gen: usize,
) -> anyhow::Result<BenchResult> {
    config.validate()?;
    let preemption = config.scheduler.preemption_mode;
    let gpu_blocks = config.cache.num_gpu_blocks;
    // Every response fits in the channel, it is only drained at the end.
    let (tx, mut rx) = channel(items.len().max(1));
    let executor = ShadowExecutor::new(&config.cache);
    config.graph.enforce_eager = true;
    let mut engine = Engine::new(config, executor, Device::Cpu)?;
    submit(&mut engine, items, n_gen, &tx).await;

    let start = Instant::now();
    let mut steps = 0;
    let mut preempted = 0;
    while engine.has_unfinished() {
        let stats = engine.step().await?;
        steps += 1;
        preempted += stats.num_preempted;
    }
    let elapsed = start.elapsed();

    let (outputs, rejected) = collect(&mut rx);
    let generated = outputs.values().flatten().map(Vec::len).sum();
    Ok(BenchResult {
        preemption,
        gpu_blocks,
        steps,
        preempted,
        generated,
        rejected,
        elapsed,
        outputs,
    })
}

#[allow(clippy::cast_precision_loss)]
fn print_results(results: &[BenchResult]) -> anyhow::Result<()> {
    let reference = results.first().map(|r| &r.outputs);
    let rows: Vec<Vec<CellStruct>> = results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let matches = Matches((i > 0).then(|| Some(&r.outputs) == reference));
            let tok_s = r.generated as f64 / r.elapsed.as_secs_f64().max(f64::EPSILON);
            vec![
                r.preemption.cell(),
                r.gpu_blocks.cell().justify(Justify::Right),
                r.steps.cell().justify(Justify::Right),
                r.preempted.cell().justify(Justify::Right),
                r.rejected.cell().justify(Justify::Right),
                r.generated.cell().justify(Justify::Right),
                format!("{tok_s:.1}").cell().justify(Justify::Right),
                matches.cell(),
            ]
        })
        .collect();

    let table = rows
        .table()
        .title(vec![
            "preemption".cell().bold(true),
            "gpu blocks".cell().bold(true),
            "steps".cell().bold(true),
            "preempted".cell().bold(true),
            "rejected".cell().bold(true),
            "tokens".cell().bold(true),
            "t/s".cell().bold(true),
            "matches".cell().bold(true),
        ])
        .bold(true);
    print_stdout(table)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    let mut base = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(block_size) = args.block_size {
        base.cache.block_size = block_size;
    }
    if let Some(cpu_blocks) = args.cpu_blocks {
        base.cache.num_cpu_blocks = cpu_blocks;
    }
    if !(0.0..=1.0).contains(&args.parallel_fraction)
        || !(0.0..=1.0).contains(&args.encoder_fraction)
    {
        anyhow::bail!("Fractions must be within [0, 1].");
    }

    let items = workload(&args);
    info!(
        "Workload: {} requests, prompts of {}..={} tokens, {} generated tokens per sequence",
        items.len(),
        args.min_prompt,
        args.max_prompt,
        args.n_gen
    );

    let mut results = Vec::new();
    for &gpu_blocks in &args.gpu_blocks {
        for &preemption in &args.preemption {
            let mut config = base.clone();
            config.cache.num_gpu_blocks = gpu_blocks;
            config.scheduler.preemption_mode = preemption;
            info!("Running with {gpu_blocks} GPU blocks, preemption {preemption}");
            results.push(run_bench(config, &items, args.n_gen).await?);
        }
    }
    print_results(&results)
}
