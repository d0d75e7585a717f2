mod model;

use std::error::Error;
use std::time::{Duration, Instant};
use clap::Parser;
use futures::stream::{self, StreamExt};
use teppan::{with_host, GenerationHost, HostConfig, ModelEvaluator, TokenId};
use tracing_subscriber::EnvFilter;
use crate::model::{decode, encode, ByteModel};

const TEXTS: [&str; 10] = [
    "The Manhattan bridge",
    "Python lists are a data structure similar to dynamically",
    "Tuples in Python are a data structure used to store multiple elements in a single variable. Just like list data structure, a tuple is",
    "Even though List and Tuple are different data structures",
    "An operating system (OS) is the program that",
    "An operating system brings powerful benefits to computer software",
    "As long as each application accesses the same resources and services",
    "An operating system provides three essential capabilities: ",
    "The GUI is most frequently used by casual or end users that are primarily",
    "An operating system can",
];

#[derive(Parser, Debug)]
#[command(name = "completion-bench", version, about = "Batched versus one-at-a-time completion throughput")]
struct Cli {
    /// Timed calls per run
    #[arg(long, default_value_t = 100)]
    num_calls: usize,
    /// Concurrent callers in the batched run
    #[arg(long, default_value_t = 16)]
    parallel: usize,
    /// Concurrent callers in the baseline run
    #[arg(long, default_value_t = 2)]
    baseline_parallel: usize,
    /// Untimed calls made before counters are reset
    #[arg(long, default_value_t = 10)]
    warm_up_calls: usize,
    /// Simulated cost of one forward pass
    #[arg(long, default_value_t = 5)]
    step_delay_ms: u64,
    /// Roughly one in this many generated tokens ends the sequence
    #[arg(long, default_value_t = 24)]
    eos_every: u64,
    #[arg(long)]
    skip_baseline: bool,
    /// Print the completion of every prompt before benchmarking
    #[arg(long)]
    show: bool,
}

struct BenchResult {
    elapsed: Duration,
    failures: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let Cli {
        num_calls,
        parallel,
        baseline_parallel,
        warm_up_calls,
        step_delay_ms,
        eos_every,
        skip_baseline,
        show: show_completions,
    } = Cli::parse();
    let config = HostConfig::load()?;
    let queries = TEXTS.iter().map(|text| encode(text)).collect::<Vec<_>>();
    let model = || ByteModel::new(Duration::from_millis(step_delay_ms), eos_every);

    println!("Test with batching");
    let queries_ref = &queries;
    let ((result, counters), shutdown) = with_host(model(), config.clone(), |host| async move {
        if show_completions {
            show(&host, queries_ref).await;
        }
        let result = benchmark(&host, queries_ref, num_calls, parallel, warm_up_calls).await;
        (result, host.counters())
    }).await?;
    report(&result, num_calls);
    println!("{counters}");
    shutdown?;

    if !skip_baseline {
        println!("Test baseline");
        let baseline = config.with_max_batch_size(1);
        let ((result, counters), shutdown) = with_host(model(), baseline, |host| async move {
            let result = benchmark(&host, queries_ref, num_calls, baseline_parallel, warm_up_calls).await;
            (result, host.counters())
        }).await?;
        report(&result, num_calls);
        println!("Query count: {}. Token count : {}", counters.queries, counters.tokens);
        shutdown?;
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn show<E: ModelEvaluator>(host: &GenerationHost<E>, queries: &[Vec<TokenId>]) {
    for query in queries {
        match host.generate(query.clone()).await {
            Ok(completion) => println!("{:?} -> {:?}", decode(query), decode(completion.generated())),
            Err(err) => println!("{:?} failed: {err}", decode(query)),
        }
    }
}

/// Warms the host up, zeroes its counters, then times `num_calls`
/// generations with at most `parallel` in flight.
async fn benchmark<E: ModelEvaluator>(
    host: &GenerationHost<E>,
    queries: &[Vec<TokenId>],
    num_calls: usize,
    parallel: usize,
    warm_up_calls: usize,
) -> BenchResult {
    for i in 0..warm_up_calls {
        if let Err(err) = host.generate(queries[i % queries.len()].clone()).await {
            tracing::warn!(error = %err, "warm-up call failed");
        }
    }
    host.reset_counters();

    let start = Instant::now();
    let failures = stream::iter(0..num_calls)
        .map(|i| host.generate(queries[i % queries.len()].clone()))
        .buffer_unordered(parallel.max(1))
        .filter(|result| futures::future::ready(result.is_err()))
        .count()
        .await;

    BenchResult { elapsed: start.elapsed(), failures }
}

fn report(result: &BenchResult, num_calls: usize) {
    let seconds = result.elapsed.as_secs_f64();
    println!(
        "{num_calls} calls in {seconds:.3}s ({:.1} calls/s), {} failed",
        num_calls as f64 / seconds.max(f64::EPSILON),
        result.failures
    );
}
