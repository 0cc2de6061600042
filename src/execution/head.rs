//! # Iteration Head
//!
//! Entry task of every superstep for one partition. On superstep 1 it builds the
//! partition's solution set and indexes the invariant input by key; afterwards it loops:
//!
//! 1. join the workset with the invariant input and ship the matches downstream, followed
//!    by an end-of-superstep event;
//! 2. wait until the back-channel for this transition is closed (and, in
//!    wait-for-update mode, until the commit is acknowledged);
//! 3. report the partition's aggregates to the barrier and wait for its decision;
//! 4. on `Continue` take the back-channel contents as the next workset, on `Terminate`
//!    shut the pipeline down and hand the final solution set back to the runtime, which
//!    delivers it once every task of the scope has finished.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::channels::OutputEmitter;
use super::functions::{Collector, FunctionContext, MatchFunction};
use super::latch::SolutionSetUpdateLatch;
use super::wiring::HeadMode;
use crate::aggregation::AggregatorSet;
use crate::back_channel::BackChannelBroker;
use crate::barrier::{BarrierDecision, BarrierHandle, HeadReport, TerminationCause};
use crate::constants::events;
use crate::error::{IterationError, Result};
use crate::logging::log_superstep_operation;
use crate::record::{Key, Record};
use crate::store::{KeyedPartitionStore, SolutionSetHandle, StoreSettings};

pub const HEAD_STAGE: &str = "Iteration Head";

/// Inputs of one head partition
#[derive(Debug, Default)]
pub struct HeadInputs {
    pub solution_set: Vec<Record>,
    pub workset: Vec<Record>,
    pub invariant: Vec<Record>,
}

/// What a head did over the scope
#[derive(Debug, Clone)]
pub struct HeadSummary {
    pub partition: usize,
    pub supersteps: u32,
    pub cause: TerminationCause,
    /// Workset size consumed at each superstep
    pub workset_sizes: Vec<usize>,
    /// Solution-set size observed at each superstep report
    pub solution_set_sizes: Vec<usize>,
    pub records_emitted: usize,
    pub final_records: usize,
}

/// A head that terminated normally, with its partition's final solution set
#[derive(Debug)]
pub struct HeadCompletion {
    pub summary: HeadSummary,
    pub final_solution_set: Vec<Record>,
}

pub struct HeadTask {
    pub iteration_id: u32,
    pub partition: usize,
    pub mode: HeadMode,
    pub matcher: Arc<dyn MatchFunction>,
    pub inputs: HeadInputs,
    pub store_settings: StoreSettings,
    pub store: SolutionSetHandle,
    pub aggregators: AggregatorSet,
    pub broker: Arc<BackChannelBroker>,
    pub barrier: BarrierHandle,
    pub outputs: Vec<OutputEmitter>,
    pub latch: Arc<SolutionSetUpdateLatch>,
}

impl HeadTask {
    pub async fn run(mut self) -> Result<HeadCompletion> {
        let inputs = std::mem::take(&mut self.inputs);
        let store =
            KeyedPartitionStore::build(self.partition, self.store_settings.clone(), inputs.solution_set)?;
        self.store.install(store);

        let invariant = index_by_key(inputs.invariant);
        let stage: Arc<str> = Arc::from(HEAD_STAGE);
        let mut workset = inputs.workset;
        let mut superstep = 1;
        let mut workset_sizes = Vec::new();
        let mut solution_set_sizes = Vec::new();

        loop {
            log_superstep_operation(
                events::SUPERSTEP_STARTED,
                self.iteration_id,
                superstep,
                Some(self.partition),
                "head",
                Some(&format!("workset={}", workset.len())),
            );
            workset_sizes.push(workset.len());

            let context = FunctionContext::new(
                stage.clone(),
                self.partition,
                superstep,
                self.store.clone(),
                self.aggregators.clone(),
            );
            self.process_workset(&workset, &invariant, &context).await?;
            for output in &mut self.outputs {
                output.end_superstep(superstep).await?;
            }

            self.broker
                .channel(self.iteration_id, self.partition, superstep)
                .wait_closed()
                .await?;
            if self.mode == HeadMode::WaitForSolutionSetUpdate {
                self.latch.wait(superstep).await?;
            }
            solution_set_sizes.push(self.store.len()?);

            log_superstep_operation(
                events::SUPERSTEP_HEAD_DONE,
                self.iteration_id,
                superstep,
                Some(self.partition),
                "head",
                None,
            );
            self.barrier
                .report(HeadReport {
                    partition: self.partition,
                    superstep,
                    aggregates: self.aggregators.snapshot_and_reset(),
                })
                .await?;

            match self.barrier.decision(superstep).await? {
                BarrierDecision::Continue => {
                    workset = self
                        .broker
                        .take(self.iteration_id, self.partition, superstep)
                        .await?;
                    superstep += 1;
                }
                BarrierDecision::Terminate(TerminationCause::Aborted) => {
                    return Err(IterationError::ScopeAborted {
                        iteration_id: self.iteration_id,
                    })
                }
                BarrierDecision::Terminate(cause) => {
                    let final_solution_set = self.finish(superstep).await?;
                    let summary = HeadSummary {
                        partition: self.partition,
                        supersteps: superstep,
                        cause,
                        workset_sizes,
                        solution_set_sizes,
                        records_emitted: self.outputs.iter().map(OutputEmitter::emitted).sum(),
                        final_records: final_solution_set.len(),
                    };
                    return Ok(HeadCompletion {
                        summary,
                        final_solution_set,
                    });
                }
            }
        }
    }

    async fn process_workset(
        &mut self,
        workset: &[Record],
        invariant: &HashMap<Key, Vec<Record>>,
        context: &FunctionContext,
    ) -> Result<()> {
        for record in workset {
            let Some(matches) = invariant.get(&record.key) else {
                continue;
            };
            let mut out = Collector::new();
            for candidate in matches {
                self.matcher
                    .join(record, candidate, context, &mut out)
                    .map_err(|error| {
                        IterationError::user_function(
                            HEAD_STAGE,
                            Some(record.key),
                            context.superstep(),
                            &error,
                        )
                    })?;
            }
            for emitted in out.into_records() {
                for output in &mut self.outputs {
                    output.emit(emitted.clone()).await?;
                }
            }
        }
        Ok(())
    }

    /// Shut the pipeline down and read the final solution set
    async fn finish(&mut self, superstep: u32) -> Result<Vec<Record>> {
        for output in &mut self.outputs {
            output.terminate().await?;
        }
        let leftover = self
            .broker
            .take(self.iteration_id, self.partition, superstep)
            .await?;
        debug!(
            iteration_id = self.iteration_id,
            partition = self.partition,
            superstep = superstep,
            discarded = leftover.len(),
            "🧹 HEAD: discarded final workset"
        );

        // The last superstep's commit must be in the final output whatever the head mode
        self.latch.wait(superstep).await?;

        self.store.entries()
    }
}

fn index_by_key(records: Vec<Record>) -> HashMap<Key, Vec<Record>> {
    let mut index: HashMap<Key, Vec<Record>> = HashMap::new();
    for record in records {
        index.entry(record.key).or_default().push(record);
    }
    index
}
