//! # Iteration Configuration
//!
//! Configuration for one iterative scope. Values come from TOML files under
//! `config/iteration/` (a base file plus an optional per-environment override) and from
//! `ITERFLOW__*` environment variables, merged by the `config` crate.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use iterflow_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//! println!("running {} partitions, at most {} supersteps", config.parallelism, config.max_supersteps);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::defaults;
use crate::execution::wiring::{HeadMode, TailWiring};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration for an iterative scope
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IterationConfig {
    /// Identifier of the iterative scope
    pub iteration_id: u32,

    /// Upper bound on supersteps; reaching it is a normal termination
    pub max_supersteps: u32,

    /// Number of partitions (parallel instances per role)
    pub parallelism: usize,

    /// Placement of the solution-set commit and workset production
    pub wiring: TailWiring,

    /// Explicit head mode. When absent the wiring's default is used.
    pub head_mode: Option<HeadMode>,

    /// Explicit reprobe setting for committing stages. When absent the wiring's default is used.
    pub solution_set_update_without_reprobe: Option<bool>,

    /// Bounded buffer size of in-process and network edges
    pub channel_capacity: usize,

    /// How long the barrier waits for all heads of a superstep
    pub barrier_timeout_ms: u64,

    pub memory: MemoryConfig,

    pub spill: SpillConfig,
}

/// Per-partition memory budgets
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub solution_set_memory_bytes: usize,
    pub back_channel_memory_bytes: usize,
    /// Largest single record the solution set accepts
    pub max_record_bytes: usize,
    /// Hash buckets per partition store; the unit of spilling
    pub store_buckets: usize,
}

/// Secondary storage settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Directory for spill files; the system temp directory when absent
    pub directory: Option<PathBuf>,
    pub io_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            iteration_id: 1,
            max_supersteps: defaults::MAX_SUPERSTEPS,
            parallelism: defaults::PARALLELISM,
            wiring: TailWiring::Unified,
            head_mode: None,
            solution_set_update_without_reprobe: None,
            channel_capacity: defaults::CHANNEL_CAPACITY,
            barrier_timeout_ms: defaults::BARRIER_TIMEOUT_MS,
            memory: MemoryConfig::default(),
            spill: SpillConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            solution_set_memory_bytes: defaults::MEMORY_PER_CONSUMER_BYTES,
            back_channel_memory_bytes: defaults::MEMORY_PER_CONSUMER_BYTES,
            max_record_bytes: defaults::MAX_RECORD_BYTES,
            store_buckets: defaults::STORE_BUCKETS,
        }
    }
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            directory: None,
            io_retries: defaults::SPILL_IO_RETRIES,
            retry_backoff_ms: defaults::SPILL_RETRY_BACKOFF_MS,
        }
    }
}

impl IterationConfig {
    /// Head mode in effect: the explicit setting, or the wiring's default
    pub fn effective_head_mode(&self) -> HeadMode {
        self.head_mode
            .unwrap_or_else(|| self.wiring.default_head_mode())
    }

    /// Reprobe setting in effect for committing stages
    pub fn effective_without_reprobe(&self) -> bool {
        self.solution_set_update_without_reprobe
            .unwrap_or_else(|| self.wiring.default_without_reprobe())
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn spill_directory(&self) -> PathBuf {
        self.spill
            .directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Validate the configuration before a scope is created
    pub fn validate(&self) -> ConfigResult<()> {
        if self.parallelism == 0 {
            return Err(ConfigurationError::invalid_value(
                "parallelism",
                "0",
                "at least one partition is required",
            ));
        }
        if self.max_supersteps == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_supersteps",
                "0",
                "the iteration must be allowed at least one superstep",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "channel_capacity",
                "0",
                "edges need room for at least one message",
            ));
        }
        if self.barrier_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "barrier_timeout_ms",
                "0",
                "barrier timeout must be positive",
            ));
        }
        if self.memory.store_buckets == 0 {
            return Err(ConfigurationError::invalid_value(
                "memory.store_buckets",
                "0",
                "the store needs at least one bucket",
            ));
        }
        if self.memory.max_record_bytes == 0
            || self.memory.max_record_bytes > self.memory.solution_set_memory_bytes
        {
            return Err(ConfigurationError::invalid_value(
                "memory.max_record_bytes",
                self.memory.max_record_bytes.to_string(),
                format!(
                    "must be positive and fit in solution_set_memory_bytes ({})",
                    self.memory.solution_set_memory_bytes
                ),
            ));
        }
        if self.wiring.requires_commit_acknowledgement()
            && self.effective_head_mode() == HeadMode::FireAndForget
        {
            return Err(ConfigurationError::validation_error(format!(
                "wiring '{}' commits the solution set after the workset is produced; \
                 head mode must be wait_for_solution_set_update",
                self.wiring
            )));
        }
        Ok(())
    }
}
