//! Bundled configuration files drive real scopes

mod common;

use std::sync::Arc;

use iterflow_core::config::ConfigManager;
use iterflow_core::programs::connected_components::check_odd_even_result;
use iterflow_core::runtime::{run_iteration, CollectingSink};
use iterflow_core::TailWiring;

#[test]
fn test_every_bundled_environment_loads_and_validates() {
    for environment in ["development", "test", "production"] {
        let manager = ConfigManager::load_from_directory_with_env(None, environment)
            .unwrap_or_else(|e| panic!("{environment}: {e}"));
        assert_eq!(manager.environment(), environment);
        assert!(manager.config().parallelism > 0);
        assert_eq!(manager.config().wiring, TailWiring::Unified);
    }

    let production = ConfigManager::load_from_directory_with_env(None, "production").unwrap();
    assert_eq!(production.config().parallelism, 16);
    assert_eq!(production.config().memory.store_buckets, 128);
}

#[test]
fn test_unknown_environment_falls_back_to_base() {
    let manager = ConfigManager::load_from_directory_with_env(None, "staging").unwrap();
    assert_eq!(manager.config().parallelism, 4);
    assert_eq!(manager.config().barrier_timeout_ms, 60_000);
}

#[tokio::test]
async fn test_loaded_configuration_runs_every_wiring() {
    let manager = ConfigManager::load_from_directory_with_env(None, "test").unwrap();
    let spill_dir = tempfile::tempdir().unwrap();

    for wiring in TailWiring::ALL {
        let mut config = manager.config().clone();
        config.wiring = wiring;
        config.spill.directory = Some(spill_dir.path().to_path_buf());

        let sink = Arc::new(CollectingSink::new());
        let job = common::odd_even_job(config, 300, 1_500).with_sink(sink.clone());
        let outcome = run_iteration(job).await.unwrap();
        assert!(outcome.converged(), "{wiring}");
        assert_eq!(sink.records().len(), 300);
        check_odd_even_result(&sink.records()).unwrap();
    }
}
