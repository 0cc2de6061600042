use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use iterflow_core::back_channel::{BackChannel, BackChannelSettings};
use iterflow_core::config::IterationConfig;
use iterflow_core::programs::connected_components::{self, enumerate_vertices, random_odd_even_edges};
use iterflow_core::store::StoreSettings;
use iterflow_core::{KeyedPartitionStore, Record, TailWiring};

fn records(count: i64) -> Vec<Record> {
    (1..=count).map(|key| Record::pair(key, key)).collect()
}

fn store_settings(memory_budget_bytes: usize) -> (tempfile::TempDir, StoreSettings) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = IterationConfig::default();
    config.memory.solution_set_memory_bytes = memory_budget_bytes;
    config.spill.directory = Some(dir.path().to_path_buf());
    (dir, StoreSettings::from_config(&config))
}

fn benchmark_store_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_build");
    for budget in [64 * 1024 * 1024, 16 * 1024] {
        let (_dir, settings) = store_settings(budget);
        group.bench_with_input(BenchmarkId::from_parameter(budget), &settings, |b, settings| {
            b.iter(|| KeyedPartitionStore::build(0, settings.clone(), records(10_000)).expect("build"))
        });
    }
    group.finish();
}

fn benchmark_store_probe_update(c: &mut Criterion) {
    let (_dir, settings) = store_settings(64 * 1024 * 1024);
    let mut store = KeyedPartitionStore::build(0, settings, records(10_000)).expect("build");

    c.bench_function("store_probe", |b| {
        b.iter(|| store.probe(black_box(5_000)).expect("probe"))
    });
    c.bench_function("store_update_with_reprobe", |b| {
        b.iter(|| store.update(Record::pair(5_000, black_box(1))).expect("update"))
    });
    c.bench_function("store_update_without_reprobe", |b| {
        b.iter(|| {
            store
                .update_without_reprobe(Record::pair(5_000, black_box(1)))
                .expect("update")
        })
    });
}

fn benchmark_back_channel(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = IterationConfig::default();
    config.spill.directory = Some(dir.path().to_path_buf());
    let settings = BackChannelSettings::from_config(&config);

    c.bench_function("back_channel_write_read", |b| {
        b.iter(|| {
            let channel = BackChannel::new(1, 0, 1, settings.clone());
            channel.write(records(1_000)).expect("write");
            channel.close().expect("close");
            channel.try_read().expect("read")
        })
    });
}

fn benchmark_connected_components(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let vertices = enumerate_vertices(200).expect("vertices");
    let edges = random_odd_even_edges(1_000, 200, connected_components::SEED).expect("edges");

    let mut group = c.benchmark_group("connected_components");
    group.sample_size(10);
    for wiring in TailWiring::ALL {
        group.bench_function(BenchmarkId::from_parameter(wiring), |b| {
            b.iter(|| {
                let config = IterationConfig {
                    wiring,
                    parallelism: 2,
                    ..IterationConfig::default()
                };
                let job = connected_components::job(config, &vertices, edges.clone());
                runtime
                    .block_on(iterflow_core::run_iteration(job))
                    .expect("iteration")
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_store_build,
    benchmark_store_probe_update,
    benchmark_back_channel,
    benchmark_connected_components
);
criterion_main!(benches);
