//! Configuration Loader
//!
//! Environment-aware loading: `base/iteration.toml` is required, then
//! `environments/<env>/iteration.toml` is layered on top when present, then
//! `ITERFLOW__*` environment variables (`ITERFLOW__MEMORY__STORE_BUCKETS=64`).

use super::error::{ConfigResult, ConfigurationError};
use super::IterationConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_NAME: &str = "iteration.toml";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: IterationConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for tests that must not touch global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            iteration_id = config.iteration_id,
            parallelism = config.parallelism,
            max_supersteps = config.max_supersteps,
            wiring = %config.wiring,
            "⚙️ CONFIG: Iteration configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, validating it
    pub fn from_config(config: IterationConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &IterationConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<IterationConfig> {
        let base_path = config_directory.join("base").join(CONFIG_FILE_NAME);
        if !base_path.is_file() {
            return Err(ConfigurationError::config_file_not_found(vec![base_path]));
        }

        let env_path = config_directory
            .join("environments")
            .join(environment)
            .join(CONFIG_FILE_NAME);
        if env_path.is_file() {
            debug!("Applying environment overrides from {}", env_path.display());
        }

        let settings = Config::builder()
            .add_source(File::from(base_path))
            .add_source(File::from(env_path).required(false))
            .add_source(
                Environment::with_prefix("ITERFLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        settings
            .try_deserialize::<IterationConfig>()
            .map_err(|e| ConfigurationError::load_error(environment, e))
    }

    /// Detect environment from `ITERFLOW_ENV`, falling back to `development`
    pub fn detect_environment() -> String {
        env::var("ITERFLOW_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    /// `ITERFLOW_CONFIG_ROOT` when set, otherwise `config/iteration` under the crate root
    fn default_config_directory() -> PathBuf {
        if let Ok(root) = env::var("ITERFLOW_CONFIG_ROOT") {
            return PathBuf::from(root).join("iteration");
        }
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("config")
            .join("iteration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::wiring::TailWiring;
    use std::fs;

    fn write_config(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_missing_base_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigManager::load_from_directory_with_env(
            Some(dir.path().to_path_buf()),
            "test",
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "base/iteration.toml",
            "iteration_id = 3\nmax_supersteps = 50\nparallelism = 2\n",
        );
        write_config(
            dir.path(),
            "environments/test/iteration.toml",
            "max_supersteps = 7\nwiring = \"separate_tails\"\n[memory]\nstore_buckets = 8\n",
        );

        let manager = ConfigManager::load_from_directory_with_env(
            Some(dir.path().to_path_buf()),
            "test",
        )
        .unwrap();
        let config = manager.config();
        assert_eq!(config.iteration_id, 3);
        assert_eq!(config.max_supersteps, 7);
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.wiring, TailWiring::SeparateTails);
        assert_eq!(config.memory.store_buckets, 8);
        assert_eq!(manager.environment(), "test");
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "base/iteration.toml", "parallelism = 0\n");
        let result = ConfigManager::load_from_directory_with_env(
            Some(dir.path().to_path_buf()),
            "production",
        );
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_bundled_configuration_loads() {
        let manager = ConfigManager::load_from_directory_with_env(None, "test").unwrap();
        assert!(manager.config().parallelism >= 1);
    }
}
