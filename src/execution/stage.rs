//! # Intermediate and Tail Stages
//!
//! One task per (stage, partition). Each superstep the stage collects its input through
//! the input gate, applies its local strategy and driver, then applies its capabilities to
//! the driver output: commit to the solution set, write the back-channel, forward to the
//! downstream stages. A stage keeps nothing across supersteps.

use std::sync::Arc;

use super::channels::{InputGate, OutputEmitter};
use super::drivers::KeyRouting;
use super::functions::FunctionContext;
use super::latch::SolutionSetUpdateLatch;
use super::wiring::StageSpec;
use crate::aggregation::AggregatorSet;
use crate::back_channel::BackChannelBroker;
use crate::constants::{aggregators, events};
use crate::error::Result;
use crate::logging::log_superstep_operation;
use crate::record::Record;
use crate::store::SolutionSetHandle;

#[derive(Debug, Clone)]
pub struct StageSummary {
    pub name: String,
    pub partition: usize,
    pub supersteps: u32,
    pub records_in: usize,
    pub records_out: usize,
}

pub struct StageTask {
    pub iteration_id: u32,
    pub partition: usize,
    pub spec: StageSpec,
    pub routing: KeyRouting,
    pub without_reprobe: bool,
    pub gate: InputGate,
    pub outputs: Vec<OutputEmitter>,
    pub store: SolutionSetHandle,
    pub aggregators: AggregatorSet,
    pub broker: Arc<BackChannelBroker>,
    pub latch: Arc<SolutionSetUpdateLatch>,
}

impl StageTask {
    pub async fn run(mut self) -> Result<StageSummary> {
        let name: Arc<str> = Arc::from(self.spec.name.as_str());
        let mut superstep = 1;
        let mut records_in = 0;
        let mut records_out = 0;

        while let Some(input) = self.gate.next_superstep(superstep).await? {
            records_in += input.len();
            let input = self.spec.local_strategy.apply(input);
            let context = FunctionContext::new(
                name.clone(),
                self.partition,
                superstep,
                self.store.clone(),
                self.aggregators.clone(),
            );
            let output = self.spec.driver.run(input, &context, self.routing)?;
            records_out += output.len();

            if self.spec.capabilities.solution_set_update {
                self.commit(&output)?;
            }
            if self.spec.capabilities.workset_update {
                self.produce_workset(superstep, &output)?;
            }
            if self.spec.capabilities.solution_set_update {
                self.latch.acknowledge(superstep);
            }

            for output_edge in &mut self.outputs {
                output_edge.emit_all(output.iter().cloned()).await?;
                output_edge.end_superstep(superstep).await?;
            }

            log_superstep_operation(
                events::SUPERSTEP_STAGE_DONE,
                self.iteration_id,
                superstep,
                Some(self.partition),
                &self.spec.name,
                Some(&format!("out={}", output.len())),
            );
            superstep += 1;
        }

        for output_edge in &mut self.outputs {
            output_edge.terminate().await?;
        }
        Ok(StageSummary {
            name: self.spec.name,
            partition: self.partition,
            supersteps: superstep - 1,
            records_in,
            records_out,
        })
    }

    fn commit(&self, records: &[Record]) -> Result<()> {
        for record in records {
            self.store.commit(record.clone(), self.without_reprobe)?;
        }
        self.aggregators
            .add_long(aggregators::SOLUTION_SET_UPDATES, records.len() as i64)
    }

    /// Write the next workset and count it before the close lets the head proceed
    fn produce_workset(&self, superstep: u32, records: &[Record]) -> Result<()> {
        let channel = self
            .broker
            .channel(self.iteration_id, self.partition, superstep);
        channel.write(records.iter().cloned())?;
        self.aggregators
            .add_long(aggregators::WORKSET_SIZE, records.len() as i64)?;
        channel.close()?;
        Ok(())
    }
}
