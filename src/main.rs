//! Offline configuration search.
//!
//! Reads a latency matrix (one row per line, microseconds) and prints the
//! weight configuration and leader with the lowest predicted latency, next to
//! the score of the configuration given on the command line.
//!
//! ```bash
//! weighted-bft --latencies wan.txt --config replica.toml --r-max 0,1 --leader 0
//! ```

use std::{error::Error, fs, path::PathBuf};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weighted_bft::{
    config::{Config, ConfigError},
    weights::{ConfigurationOptimizer, LatencyMatrix, ReplicaId, WeightConfiguration},
};

#[derive(Parser, Debug)]
#[command(name = "weighted-bft")]
#[command(version, about, long_about = None)]
struct Args {
    /// Latency matrix file
    #[arg(short = 'l', long)]
    latencies: PathBuf,

    /// TOML configuration; defaults apply when omitted
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Replicas currently in R_max (defaults to the first u replicas)
    #[arg(long, value_delimiter = ',')]
    r_max: Vec<ReplicaId>,

    /// Current leader
    #[arg(long, default_value = "0")]
    leader: ReplicaId,

    /// Seed for the randomized strategies
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let matrix: LatencyMatrix = fs::read_to_string(&args.latencies)?.parse()?;

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.replication.n = matrix.len();
            config.validate()?;
            config
        }
    };
    if config.replication.n != matrix.len() {
        return Err(ConfigError::Members {
            expected: config.replication.n,
            actual: matrix.len(),
        }
        .into());
    }

    let replicas: Vec<ReplicaId> = (0..matrix.len()).collect();
    let u = config.fault_mode().u(config.replication.f);
    let current = if args.r_max.is_empty() {
        WeightConfiguration::from_permutation(u, &replicas)
    } else {
        WeightConfiguration::new(u, args.r_max.iter().copied(), &replicas)?
    };

    let sanitized = matrix.sanitize();
    info!(
        n = matrix.len(),
        f = config.replication.f,
        delta = config.replication.delta,
        strategy = ?config.optimizer.strategy,
        "Searching for the best configuration"
    );
    let optimizer = ConfigurationOptimizer::new(config.simulator(), config.optimizer_settings());
    let outcome = optimizer.compute_best(&sanitized, &sanitized, &current, args.leader, args.seed);

    let search = &outcome.search;
    println!("\n=== Configuration Search ===");
    println!("Current:     {}", outcome.current);
    println!("Best:        {}", search.best);
    println!("Worst seen:  {}", search.worst_latency);
    println!("Evaluations: {}", search.evaluations);
    println!("Elapsed:     {:.3} ms", search.elapsed.as_secs_f64() * 1000.0);
    println!(
        "Speed-up:    {:.3}x",
        outcome.current.predicted_latency as f64 / search.best.predicted_latency.max(1) as f64
    );
    Ok(())
}
