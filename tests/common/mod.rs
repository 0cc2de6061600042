//! Shared helpers for iteration integration tests

#![allow(dead_code)]

pub mod strategies;

use std::sync::Arc;

use iterflow_core::config::IterationConfig;
use iterflow_core::programs::connected_components::{self, enumerate_vertices, random_odd_even_edges};
use iterflow_core::runtime::{run_iteration, CollectingSink, IterationJob, IterationOutcome};
use iterflow_core::{Record, TailWiring};

/// Configuration tuned for tests: short barrier timeout, spill files under `spill_dir`
pub fn test_config(wiring: TailWiring, spill_dir: &tempfile::TempDir) -> IterationConfig {
    let mut config = IterationConfig {
        wiring,
        parallelism: 4,
        barrier_timeout_ms: 20_000,
        channel_capacity: 64,
        ..IterationConfig::default()
    };
    config.spill.directory = Some(spill_dir.path().to_path_buf());
    config
}

/// Configuration whose solution set and back-channel budgets force spilling
pub fn spilling_config(wiring: TailWiring, spill_dir: &tempfile::TempDir) -> IterationConfig {
    let mut config = test_config(wiring, spill_dir);
    config.memory.solution_set_memory_bytes = 2 * 1024;
    config.memory.back_channel_memory_bytes = 512;
    config.memory.max_record_bytes = 256;
    config.memory.store_buckets = 8;
    config
}

/// Run a job with a collecting sink attached
pub async fn run_collecting(
    job: IterationJob,
) -> (iterflow_core::Result<IterationOutcome>, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let result = run_iteration(job.with_sink(sink.clone())).await;
    (result, sink)
}

/// Connected components over the odd/even graph of the given size
pub fn odd_even_job(config: IterationConfig, vertices: usize, edges: usize) -> IterationJob {
    let vertex_records = enumerate_vertices(vertices).expect("vertices");
    let edge_records =
        random_odd_even_edges(edges, vertices, connected_components::SEED).expect("edges");
    connected_components::job(config, &vertex_records, edge_records)
}

/// Component id of every vertex, ordered by vertex
pub fn components(records: &[Record]) -> Vec<(i64, i64)> {
    records
        .iter()
        .map(|record| (record.key, record.long(0).expect("component id")))
        .collect()
}

/// Records `(key, key)` for keys `1..=count`
pub fn identity_records(count: i64) -> Vec<Record> {
    (1..=count).map(|key| Record::pair(key, key)).collect()
}
