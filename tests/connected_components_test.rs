//! Connected components on the odd/even reference graph under every tail wiring

mod common;

use common::*;
use iterflow_core::barrier::BarrierDecision;
use iterflow_core::constants::aggregators;
use iterflow_core::programs::connected_components::{
    check_odd_even_result, NUM_EDGES, NUM_VERTICES,
};
use iterflow_core::{Record, TailWiring, TerminationCause};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_odd_even_components_under_every_wiring() {
    let spill_dir = tempfile::tempdir().unwrap();
    let mut reference: Option<(Vec<(i64, i64)>, u32, Vec<i64>)> = None;

    for wiring in TailWiring::ALL {
        let config = test_config(wiring, &spill_dir);
        let (result, sink) = run_collecting(odd_even_job(config, NUM_VERTICES, NUM_EDGES)).await;
        let outcome = result.unwrap_or_else(|e| panic!("{wiring} failed: {e}"));

        assert_eq!(outcome.cause, TerminationCause::Converged, "{wiring}");
        assert_eq!(outcome.wiring, wiring);
        assert_eq!(sink.deliveries(), 4, "{wiring}");

        let records = sink.records();
        assert_eq!(records.len(), NUM_VERTICES, "{wiring}");
        check_odd_even_result(&records).unwrap();

        let observed = (components(&records), outcome.supersteps, outcome.workset_sizes());
        match &reference {
            None => reference = Some(observed),
            Some(expected) => assert_eq!(&observed, expected, "{wiring} diverged"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_superstep_summaries_end_with_convergence() {
    let spill_dir = tempfile::tempdir().unwrap();
    let config = test_config(TailWiring::SeparateTails, &spill_dir);
    let (result, _sink) = run_collecting(odd_even_job(config, NUM_VERTICES, NUM_EDGES)).await;
    let outcome = result.unwrap();

    assert_eq!(outcome.summaries.len(), outcome.supersteps as usize);
    let (last, earlier) = outcome.summaries.split_last().unwrap();
    assert_eq!(last.decision, BarrierDecision::Terminate(TerminationCause::Converged));
    assert_eq!(last.superstep, outcome.supersteps);
    for (index, summary) in earlier.iter().enumerate() {
        assert_eq!(summary.superstep, index as u32 + 1);
        assert_eq!(summary.decision, BarrierDecision::Continue);
    }

    let sizes = outcome.workset_sizes();
    assert_eq!(sizes.last(), Some(&0));
    assert!(sizes[..sizes.len() - 1].iter().all(|size| *size > 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_workset_record_reaches_the_next_superstep_once() {
    let spill_dir = tempfile::tempdir().unwrap();
    for wiring in TailWiring::ALL {
        let config = test_config(wiring, &spill_dir);
        let (result, _sink) = run_collecting(odd_even_job(config, NUM_VERTICES, NUM_EDGES)).await;
        let outcome = result.unwrap();
        let produced = outcome.workset_sizes();

        let consumed_first: usize = outcome.heads.iter().map(|head| head.workset_sizes[0]).sum();
        assert_eq!(consumed_first, NUM_VERTICES, "{wiring}");

        for superstep in 1..outcome.supersteps as usize {
            let consumed: usize = outcome
                .heads
                .iter()
                .map(|head| head.workset_sizes[superstep])
                .sum();
            assert_eq!(
                consumed as i64,
                produced[superstep - 1],
                "{wiring}: workset handed into superstep {}",
                superstep + 1
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_solution_set_key_set_never_changes() {
    let spill_dir = tempfile::tempdir().unwrap();
    let config = test_config(TailWiring::IntermediateWorksetUpdate, &spill_dir);
    let (result, sink) = run_collecting(odd_even_job(config, NUM_VERTICES, NUM_EDGES)).await;
    let outcome = result.unwrap();

    let mut total = 0;
    for head in &outcome.heads {
        let initial = head.solution_set_sizes[0];
        assert!(head.solution_set_sizes.iter().all(|size| *size == initial));
        assert_eq!(head.final_records, initial);
        total += initial;
    }
    assert_eq!(total, NUM_VERTICES);

    let keys: Vec<i64> = sink.records().iter().map(|record| record.key).collect();
    assert_eq!(keys, (1..=NUM_VERTICES as i64).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_solution_set_updates_match_workset_sizes() {
    let spill_dir = tempfile::tempdir().unwrap();
    for wiring in TailWiring::ALL {
        let config = test_config(wiring, &spill_dir);
        let (result, _sink) = run_collecting(odd_even_job(config, NUM_VERTICES, NUM_EDGES)).await;
        let outcome = result.unwrap();
        assert_eq!(
            outcome.aggregate_series(aggregators::SOLUTION_SET_UPDATES),
            outcome.workset_sizes(),
            "{wiring}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reprobe_setting_does_not_change_results() {
    let spill_dir = tempfile::tempdir().unwrap();
    for wiring in [TailWiring::Unified, TailWiring::IntermediateWorksetUpdate] {
        let mut results = Vec::new();
        for without_reprobe in [false, true] {
            let mut config = test_config(wiring, &spill_dir);
            config.solution_set_update_without_reprobe = Some(without_reprobe);
            let (result, sink) =
                run_collecting(odd_even_job(config, NUM_VERTICES, NUM_EDGES)).await;
            let outcome = result.unwrap();
            results.push((components(&sink.records()), outcome.supersteps));
        }
        assert_eq!(results[0], results[1], "{wiring}");
    }
}

#[tokio::test]
async fn test_result_does_not_depend_on_parallelism() {
    let spill_dir = tempfile::tempdir().unwrap();
    let mut results = Vec::new();
    for parallelism in [1, 3] {
        let mut config = test_config(TailWiring::Unified, &spill_dir);
        config.parallelism = parallelism;
        let (result, sink) = run_collecting(odd_even_job(config, 200, 1_000)).await;
        let outcome = result.unwrap();
        assert_eq!(sink.deliveries(), parallelism);
        results.push((components(&sink.records()), outcome.supersteps));
    }
    assert_eq!(results[0], results[1]);
    check_odd_even_result(&sink_records_of(results[0].0.clone())).unwrap();
}

fn sink_records_of(components: Vec<(i64, i64)>) -> Vec<Record> {
    components
        .into_iter()
        .map(|(vertex, component)| Record::pair(vertex, component))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_components_survive_spilling() {
    let spill_dir = tempfile::tempdir().unwrap();
    for wiring in TailWiring::ALL {
        let config = spilling_config(wiring, &spill_dir);
        let (result, sink) = run_collecting(odd_even_job(config, NUM_VERTICES, NUM_EDGES)).await;
        let outcome = result.unwrap_or_else(|e| panic!("{wiring} failed while spilling: {e}"));
        assert!(outcome.converged());

        let records = sink.records();
        assert_eq!(records.len(), NUM_VERTICES);
        check_odd_even_result(&records).unwrap();
    }
}
