//! # Iteration Runtime
//!
//! Executes one iterative scope as a set of tokio tasks: the barrier, and for every
//! partition a head plus one task per planned stage. Partitions share nothing but the
//! barrier and the edges between them; the solution set of a partition lives in its arena
//! slot and the workset travels through the back-channel broker.
//!
//! The first task to fail aborts the scope. Remaining tasks are cancelled, back-channels
//! and stores are released, and the root-cause error is returned. Errors that merely
//! report the teardown (closed channels, aborted scope) never mask the root cause.
//!
//! Heads hand their final solution sets back to the runtime. The sink receives them in one
//! delivery, only after every task of the scope has joined without error.

pub mod job;
pub mod sink;

pub use job::{IterationJob, IterationProgram};
pub use sink::{CollectingSink, DiscardingSink, FinalOutput, FinalSink, FINAL_SINK_STAGE};

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::aggregation::{AggregateValue, AggregatorSet};
use crate::back_channel::{BackChannelBroker, BackChannelSettings};
use crate::barrier::{BarrierOutcome, BarrierSettings, SuperstepSummary, SyncBarrier, TerminationCause};
use crate::constants::{aggregators, events};
use crate::error::{IterationError, Result};
use crate::execution::head::HEAD_STAGE;
use crate::execution::{
    ExecutionPlan, HeadCompletion, HeadInputs, HeadMode, HeadSummary, HeadTask, InputGate, OutputEmitter,
    SolutionSetUpdateLatch, StageInput, StageMessage, StageSummary, StageTask, TailWiring,
};
use crate::logging::{log_error, log_superstep_operation};
use crate::record::Record;
use crate::record::Partitioner;
use crate::store::{SolutionSetArena, StoreSettings};

/// Result of a completed iterative scope
#[derive(Debug, Clone, Serialize)]
pub struct IterationOutcome {
    pub run_id: Uuid,
    pub iteration_id: u32,
    pub wiring: TailWiring,
    pub head_mode: HeadMode,
    pub cause: TerminationCause,
    /// Number of supersteps executed, including the terminating one
    pub supersteps: u32,
    pub summaries: Vec<SuperstepSummary>,
    #[serde(skip)]
    pub heads: Vec<HeadSummary>,
    #[serde(skip)]
    pub stages: Vec<StageSummary>,
    pub elapsed: Duration,
}

impl IterationOutcome {
    pub fn converged(&self) -> bool {
        self.cause == TerminationCause::Converged
    }

    /// Merged workset-size aggregate of every superstep
    pub fn workset_sizes(&self) -> Vec<i64> {
        self.aggregate_series(aggregators::WORKSET_SIZE)
    }

    /// Merged value of a long aggregator for every superstep
    pub fn aggregate_series(&self, name: &str) -> Vec<i64> {
        self.summaries
            .iter()
            .map(|summary| {
                summary
                    .aggregates
                    .get(name)
                    .and_then(AggregateValue::as_long)
                    .unwrap_or_default()
            })
            .collect()
    }
}

enum TaskReport {
    Barrier(BarrierOutcome),
    Head(HeadCompletion),
    Stage(StageSummary),
}

/// Runs one [`IterationJob`]
#[derive(Debug)]
pub struct IterationRuntime {
    job: IterationJob,
    plan: ExecutionPlan,
}

impl IterationRuntime {
    /// Validate the configuration and compose the execution plan
    pub fn new(job: IterationJob) -> Result<Self> {
        job.config.validate()?;
        let plan = ExecutionPlan::compose(
            &job.config,
            job.program.intermediates.clone(),
            job.program.solution_set_join.clone(),
            job.edges,
        )?;
        Ok(Self { job, plan })
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub async fn run(self) -> Result<IterationOutcome> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let Self { job, plan } = self;
        let config = &job.config;
        let iteration_id = config.iteration_id;
        let parallelism = config.parallelism;

        info!(
            run_id = %run_id,
            iteration_id = iteration_id,
            program = %job.program.name,
            wiring = %plan.wiring,
            head_mode = %plan.head_mode,
            without_reprobe = plan.without_reprobe,
            parallelism = parallelism,
            stages = plan.stages.len(),
            event = events::SCOPE_STARTED,
            "🚀 ITERATION: starting scope"
        );

        let arena = SolutionSetArena::new(parallelism);
        let broker = Arc::new(BackChannelBroker::new(BackChannelSettings::from_config(config)));
        let registry = Arc::new(job.program.aggregators.clone());
        let (barrier, barrier_handle) = SyncBarrier::new(
            BarrierSettings::from_config(config),
            registry.clone(),
            job.program.convergence.clone(),
        );
        let store_settings = StoreSettings::from_config(config);

        let partitioner = Partitioner::new(parallelism);
        let mut solution_sets = partitioner.split(job.solution_set).into_iter();
        let mut worksets = partitioner.split(job.workset).into_iter();
        let mut invariants = partitioner.split(job.invariant).into_iter();

        let mut senders = Vec::with_capacity(plan.stages.len());
        let mut receivers = Vec::with_capacity(plan.stages.len());
        for _ in &plan.stages {
            let (tx, rx): (Vec<_>, Vec<_>) = (0..parallelism)
                .map(|_| mpsc::channel::<StageMessage>(config.channel_capacity))
                .unzip();
            senders.push(tx);
            receivers.push(rx.into_iter());
        }
        let committers = plan.committers().len();

        let mut tasks: JoinSet<Result<TaskReport>> = JoinSet::new();
        tasks.spawn(
            async move { barrier.run().await.map(TaskReport::Barrier) }
                .instrument(info_span!("barrier", iteration_id = iteration_id)),
        );

        for partition in 0..parallelism {
            let aggregators = AggregatorSet::new(registry.clone());
            let latch = Arc::new(SolutionSetUpdateLatch::new(partition, committers));

            let head = HeadTask {
                iteration_id,
                partition,
                mode: plan.head_mode,
                matcher: job.program.head.clone(),
                inputs: HeadInputs {
                    solution_set: solution_sets.next().unwrap_or_default(),
                    workset: worksets.next().unwrap_or_default(),
                    invariant: invariants.next().unwrap_or_default(),
                },
                store_settings: store_settings.clone(),
                store: arena.handle(partition),
                aggregators: aggregators.clone(),
                broker: broker.clone(),
                barrier: barrier_handle.clone(),
                outputs: emitters(&plan, StageInput::Head, HEAD_STAGE, partition, &senders),
                latch: latch.clone(),
            };
            tasks.spawn(
                async move { head.run().await.map(TaskReport::Head) }.instrument(info_span!(
                    "head",
                    iteration_id = iteration_id,
                    partition = partition
                )),
            );

            for (index, spec) in plan.stages.iter().enumerate() {
                let receiver = receivers[index].next().ok_or_else(|| {
                    IterationError::channel_closed(format!("{} [{partition}] input", spec.name))
                })?;
                let stage = StageTask {
                    iteration_id,
                    partition,
                    spec: spec.clone(),
                    routing: plan.key_routing(index),
                    without_reprobe: plan.without_reprobe,
                    gate: InputGate::new(
                        format!("{} [{partition}]", spec.name),
                        receiver,
                        spec.input_edge().upstream_senders(parallelism),
                    ),
                    outputs: emitters(
                        &plan,
                        StageInput::Stage(index),
                        &spec.name,
                        partition,
                        &senders,
                    ),
                    store: arena.handle(partition),
                    aggregators: aggregators.clone(),
                    broker: broker.clone(),
                    latch: latch.clone(),
                };
                let span = info_span!(
                    "stage",
                    iteration_id = iteration_id,
                    partition = partition,
                    stage = %spec.name
                );
                tasks.spawn(async move { stage.run().await.map(TaskReport::Stage) }.instrument(span));
            }
        }
        drop(senders);
        drop(barrier_handle);

        let mut failure: Option<IterationError> = None;
        let mut barrier_outcome = None;
        let mut heads = Vec::with_capacity(parallelism);
        let mut final_partitions: Vec<Option<Vec<Record>>> = vec![None; parallelism];
        let mut stages = Vec::with_capacity(parallelism * plan.stages.len());

        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(Ok(TaskReport::Barrier(outcome))) => {
                    barrier_outcome = Some(outcome);
                    continue;
                }
                Ok(Ok(TaskReport::Head(completion))) => {
                    let HeadCompletion {
                        summary,
                        final_solution_set,
                    } = completion;
                    if let Some(slot) = final_partitions.get_mut(summary.partition) {
                        *slot = Some(final_solution_set);
                    }
                    heads.push(summary);
                    continue;
                }
                Ok(Ok(TaskReport::Stage(summary))) => {
                    stages.push(summary);
                    continue;
                }
                Err(join_error) if join_error.is_cancelled() => continue,
                Err(join_error) => IterationError::TaskJoin {
                    message: join_error.to_string(),
                },
                Ok(Err(error)) => error,
            };

            if failure.is_none() {
                log_error(
                    "iteration_runtime",
                    "task",
                    &error.to_string(),
                    Some(&format!("iteration_id={iteration_id}")),
                );
                tasks.abort_all();
                broker.release_scope(iteration_id);
            }
            failure = Some(match failure.take() {
                Some(existing) if !existing.is_secondary() || error.is_secondary() => existing,
                _ => error,
            });
        }

        arena.release_all();
        broker.release_scope(iteration_id);

        if let Some(error) = failure {
            log_superstep_operation(
                events::SCOPE_ABORTED,
                iteration_id,
                barrier_outcome.as_ref().map_or(0, |outcome| outcome.supersteps),
                None,
                "runtime",
                Some(&error.to_string()),
            );
            return Err(error);
        }

        let outcome = barrier_outcome.ok_or_else(|| IterationError::TaskJoin {
            message: "barrier finished without an outcome".to_string(),
        })?;
        let partitions = final_partitions
            .into_iter()
            .enumerate()
            .map(|(partition, records)| {
                records.ok_or_else(|| IterationError::TaskJoin {
                    message: format!("head {partition} finished without its final solution set"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let output = FinalOutput::new(partitions);
        let delivered = output.len();
        if let Err(error) = job.sink.deliver(output).await {
            let error =
                IterationError::user_function(FINAL_SINK_STAGE, None, outcome.supersteps, &error);
            log_superstep_operation(
                events::SCOPE_ABORTED,
                iteration_id,
                outcome.supersteps,
                None,
                "runtime",
                Some(&error.to_string()),
            );
            return Err(error);
        }
        let event = match outcome.cause {
            TerminationCause::Converged => events::SCOPE_CONVERGED,
            TerminationCause::MaxSuperstepsReached => events::SCOPE_MAX_SUPERSTEPS_REACHED,
            TerminationCause::Aborted => events::SCOPE_ABORTED,
        };
        log_superstep_operation(
            event,
            iteration_id,
            outcome.supersteps,
            None,
            "runtime",
            Some(&format!("cause={} delivered={delivered}", outcome.cause)),
        );

        heads.sort_by_key(|summary| summary.partition);
        stages.sort_by(|a, b| (&a.name, a.partition).cmp(&(&b.name, b.partition)));
        Ok(IterationOutcome {
            run_id,
            iteration_id,
            wiring: plan.wiring,
            head_mode: plan.head_mode,
            cause: outcome.cause,
            supersteps: outcome.supersteps,
            summaries: outcome.summaries,
            heads,
            stages,
            elapsed: started.elapsed(),
        })
    }
}

/// Convenience wrapper: validate, plan and run a job
pub async fn run_iteration(job: IterationJob) -> Result<IterationOutcome> {
    IterationRuntime::new(job)?.run().await
}

/// One emitter per stage consuming `source`, for the given producer partition
fn emitters(
    plan: &ExecutionPlan,
    source: StageInput,
    source_name: &str,
    partition: usize,
    senders: &[Vec<mpsc::Sender<StageMessage>>],
) -> Vec<OutputEmitter> {
    plan.consumers(source)
        .into_iter()
        .map(|consumer| {
            let target = &plan.stages[consumer];
            OutputEmitter::new(
                format!("{source_name} -> {}", target.name),
                target.input_edge(),
                partition,
                senders[consumer].clone(),
            )
        })
        .collect()
}
