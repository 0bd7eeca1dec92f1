use std::ops::Range;
use std::path::PathBuf;

use anyhow::{Context, bail};
use argh::FromArgs;

use hellas_view_change::sim::{SimConfig, run_view_change};
use hellas_view_change::{ViewChangeConfig, tracing_setup};

#[derive(FromArgs, PartialEq, Debug)]
/// Top-level command.
struct TopLevel {
    #[argh(subcommand)]
    nested: Subcommands,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum Subcommands {
    Run(Run),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Simulate view changes over a range of seeds
#[argh(subcommand, name = "run")]
struct Run {
    #[argh(option, default = "10")]
    /// number of seeds to run (default 10)
    seeds: u64,
    #[argh(option, default = "0")]
    /// first seed (default 0)
    first_seed: u64,
    #[argh(option)]
    /// pool size (default random 4 to 8 per seed)
    nodes: Option<usize>,
    #[argh(option, default = "0.0")]
    /// minimum message latency as a fraction of the new view timeout
    min_latency: f64,
    #[argh(option, default = "0.6")]
    /// maximum message latency as a fraction of the new view timeout
    max_latency: f64,
    #[argh(switch)]
    /// drop every ViewChange sent by the last replica
    drop_last_view_change: bool,
    #[argh(option)]
    /// path to a JSON file with view change settings
    config: Option<PathBuf>,
    #[argh(switch)]
    /// emit logs as JSON
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let top: TopLevel = argh::from_env();
    match top.nested {
        Subcommands::Run(run) => run_seeds(run),
    }
}

fn run_seeds(run: Run) -> anyhow::Result<()> {
    tracing_setup::init(run.json).map_err(|err| anyhow::anyhow!(err))?;

    let config = match &run.config {
        Some(path) => ViewChangeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ViewChangeConfig::default(),
    };
    let sim = SimConfig {
        pool_size: run.nodes,
        drop_view_changes_from_last: run.drop_last_view_change,
        ..SimConfig::default()
    }
    .with_latency_factors(&config, run.min_latency, run.max_latency);

    let mut failed = Vec::new();
    for seed in seed_range(run.first_seed, run.seeds)? {
        let (_, outcome) = run_view_change(seed, &sim, &config)
            .with_context(|| format!("setting up seed {}", seed))?;
        println!("{}", serde_json::to_string(&outcome)?);
        if !outcome.converged() {
            tracing::error!(seed, outcome = ?outcome.convergence, "view change did not converge");
            failed.push(seed);
        }
    }

    if !failed.is_empty() {
        bail!("{} of {} seeds did not converge: {:?}", failed.len(), run.seeds, failed);
    }
    Ok(())
}

fn seed_range(first_seed: u64, seeds: u64) -> anyhow::Result<Range<u64>> {
    let Some(end) = first_seed.checked_add(seeds) else {
        bail!("seed range {} + {} overflows", first_seed, seeds);
    };
    Ok(first_seed..end)
}
