//! # System Constants
//!
//! Well-known aggregator names, lifecycle event names and configuration defaults that
//! define the operational boundaries of an iterative scope.

/// Built-in aggregator names
pub mod aggregators {
    /// Long-sum of records written into the workset during a superstep.
    /// The workset-empty convergence criterion fires when its merged value is zero.
    pub const WORKSET_SIZE: &str = "iteration.workset_size";

    /// Long-sum of solution-set updates committed during a superstep
    pub const SOLUTION_SET_UPDATES: &str = "iteration.solution_set_updates";
}

/// Lifecycle event names used as structured log tags
pub mod events {
    pub const SCOPE_STARTED: &str = "scope.started";
    pub const SCOPE_CONVERGED: &str = "scope.converged";
    pub const SCOPE_MAX_SUPERSTEPS_REACHED: &str = "scope.max_supersteps_reached";
    pub const SCOPE_ABORTED: &str = "scope.aborted";

    pub const SUPERSTEP_STARTED: &str = "superstep.started";
    pub const SUPERSTEP_HEAD_DONE: &str = "superstep.head_done";
    pub const SUPERSTEP_STAGE_DONE: &str = "superstep.stage_done";
    pub const SUPERSTEP_DECIDED: &str = "superstep.decided";

    pub const STORE_BUILT: &str = "store.built";
    pub const STORE_SPILLED: &str = "store.spilled";
    pub const STORE_COMPACTED: &str = "store.compacted";

    pub const BACK_CHANNEL_CLOSED: &str = "back_channel.closed";
    pub const BACK_CHANNEL_SPILLED: &str = "back_channel.spilled";
}

/// Default configuration values
pub mod defaults {
    pub const MAX_SUPERSTEPS: u32 = 100;
    pub const PARALLELISM: usize = 4;
    pub const CHANNEL_CAPACITY: usize = 1024;
    pub const BARRIER_TIMEOUT_MS: u64 = 60_000;

    /// 10 MiB per consumer, matching the per-consumer memory of the reference job
    pub const MEMORY_PER_CONSUMER_BYTES: usize = 10 * 1024 * 1024;
    pub const MAX_RECORD_BYTES: usize = 64 * 1024;
    pub const STORE_BUCKETS: usize = 32;

    pub const SPILL_IO_RETRIES: u32 = 3;
    pub const SPILL_RETRY_BACKOFF_MS: u64 = 10;
}
