#![allow(clippy::doc_markdown)] // Allow technical terms like PageRank, JSON in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Iterflow Core Rust
//!
//! Workset iteration runtime for a bulk-synchronous dataflow engine.
//!
//! ## Overview
//!
//! An iterative scope refines a partitioned, persistent keyed state (the *solution set*)
//! by repeatedly processing a shrinking set of active records (the *workset*) until a
//! scope-wide convergence signal fires or a superstep bound is reached. Each superstep
//! runs a pipeline of tasks per partition and ends at a synchronization barrier.
//!
//! ## Architecture
//!
//! - **Head**: builds the solution set, joins the workset with a cached invariant input
//! - **Intermediates**: stateless superstep-local transforms (map, reduce, solution-set join)
//! - **Tails**: commit solution-set deltas and produce the next workset
//! - **Back-channel**: hands each partition's workset from the tail back to its head
//! - **Barrier**: merges aggregators, evaluates convergence, broadcasts continue/terminate
//!
//! Where the commit and workset production happen is chosen by one of four
//! [`execution::TailWiring`]s; all of them produce identical results.
//!
//! ## Module Organization
//!
//! - [`store`] - Keyed partition store with disk spill
//! - [`back_channel`] - Per-transition workset handoff
//! - [`barrier`] - Barrier state machine and task
//! - [`aggregation`] - Named aggregators and convergence criteria
//! - [`execution`] - Head and stage tasks, edges, drivers, wirings
//! - [`runtime`] - Job description, scope execution, final sink
//! - [`programs`] - Reference programs (connected components)
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iterflow_core::config::IterationConfig;
//! use iterflow_core::programs::connected_components;
//! use iterflow_core::runtime::{run_iteration, CollectingSink};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = Arc::new(CollectingSink::new());
//! let job = connected_components::odd_even_job(IterationConfig::default())?
//!     .with_sink(sink.clone());
//!
//! let outcome = run_iteration(job).await?;
//! println!("{} after {} supersteps", outcome.cause, outcome.supersteps);
//! connected_components::check_odd_even_result(&sink.records())?;
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod back_channel;
pub mod barrier;
pub mod config;
pub mod constants;
pub mod error;
pub mod execution;
pub mod logging;
pub mod programs;
pub mod record;
pub mod runtime;
pub mod store;

pub use aggregation::{AggregateValue, AggregatorRegistry, AggregatorSet, ConvergenceCriterion};
pub use back_channel::{BackChannel, BackChannelBroker};
pub use barrier::{BarrierDecision, BarrierState, SuperstepSummary, SyncBarrier, TerminationCause};
pub use config::{ConfigManager, ConfigurationError, IterationConfig};
pub use error::{IterationError, Result};
pub use execution::{EdgeDescriptor, HeadMode, ShipStrategy, StageSpec, TailWiring, Transport};
pub use record::{Field, Key, Partitioner, Record};
pub use runtime::{
    run_iteration, CollectingSink, FinalOutput, FinalSink, IterationJob, IterationOutcome,
    IterationProgram,
    IterationRuntime,
};
pub use store::{KeyedPartitionStore, SolutionSetArena};
