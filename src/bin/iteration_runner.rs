//! # Iteration Runner
//!
//! Runs the connected-components reference program on the odd/even graph under one or all
//! tail wirings, then verifies that odd vertices ended in component 1 and even vertices in
//! component 2.

use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use iterflow_core::config::{ConfigManager, IterationConfig};
use iterflow_core::logging::init_structured_logging;
use iterflow_core::programs::connected_components::{
    self, check_odd_even_result, enumerate_vertices, random_odd_even_edges,
};
use iterflow_core::runtime::{run_iteration, CollectingSink, IterationOutcome};
use iterflow_core::TailWiring;

#[derive(Parser)]
#[command(name = "iteration-runner")]
#[command(about = "Run connected components on the odd/even reference graph")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to load configuration for (development, test, production)
    #[arg(short, long)]
    environment: Option<String>,

    /// Configuration directory path (default: config/iteration)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Tail wiring to run, or "all" to run every wiring
    #[arg(short, long, default_value = "all")]
    wiring: String,

    /// Number of vertices
    #[arg(long, default_value_t = connected_components::NUM_VERTICES)]
    vertices: usize,

    /// Total number of edges, including the parity chains
    #[arg(long, default_value_t = connected_components::NUM_EDGES)]
    edges: usize,

    /// Seed of the edge generator
    #[arg(long, default_value_t = connected_components::SEED)]
    seed: u64,

    /// Override the configured parallelism
    #[arg(short, long)]
    parallelism: Option<usize>,

    /// Override the configured superstep bound
    #[arg(long)]
    max_supersteps: Option<u32>,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_structured_logging();

    match run(&cli).await {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let manager = match &cli.environment {
        Some(environment) => {
            ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)?
        }
        None => ConfigManager::load_from_directory(cli.config_dir.clone())?,
    };
    let mut base = manager.config().clone();
    if let Some(parallelism) = cli.parallelism {
        base.parallelism = parallelism;
    }
    if let Some(max_supersteps) = cli.max_supersteps {
        base.max_supersteps = max_supersteps;
    }

    let wirings = match cli.wiring.as_str() {
        "all" => TailWiring::ALL.to_vec(),
        wiring => vec![wiring.parse::<TailWiring>().map_err(anyhow::Error::msg)?],
    };

    println!("🔧 Connected components on the odd/even graph");
    println!(
        "Environment: {} | vertices: {} | edges: {} | seed: {:#x} | parallelism: {}",
        manager.environment(),
        cli.vertices,
        cli.edges,
        cli.seed,
        base.parallelism
    );

    let vertices = enumerate_vertices(cli.vertices)?;
    let edges = random_odd_even_edges(cli.edges, cli.vertices, cli.seed)?;

    let runs = wirings.iter().enumerate().map(|(offset, wiring)| {
        let config = IterationConfig {
            iteration_id: base.iteration_id + offset as u32,
            wiring: *wiring,
            head_mode: None,
            solution_set_update_without_reprobe: None,
            ..base.clone()
        };
        let sink = Arc::new(CollectingSink::new());
        let job = connected_components::job(config, &vertices, edges.clone()).with_sink(sink.clone());
        async move {
            let outcome = run_iteration(job).await?;
            check_odd_even_result(&sink.records())?;
            anyhow::Ok((outcome, sink.records().len()))
        }
    });
    let results = futures::future::join_all(runs).await;

    let mut failures = 0;
    for (wiring, result) in wirings.iter().zip(results) {
        match result {
            Ok((outcome, records)) => report(cli, &outcome, records)?,
            Err(e) => {
                failures += 1;
                println!("❌ {wiring}: {e:#}");
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} wirings failed", wirings.len());
    }
    println!("\n🎉 All wirings produced the odd/even components");
    Ok(())
}

fn report(cli: &Cli, outcome: &IterationOutcome, records: usize) -> anyhow::Result<()> {
    if cli.format == "json" {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    println!(
        "✅ {:<34} {:<22} supersteps: {:>3}  vertices: {:>7}  elapsed: {:?}",
        outcome.wiring.to_string(),
        outcome.cause.to_string(),
        outcome.supersteps,
        records,
        outcome.elapsed
    );
    println!("   workset sizes: {:?}", outcome.workset_sizes());
    Ok(())
}
