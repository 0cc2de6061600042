//! Job description handed to the runtime by an external job-graph builder

use std::fmt;
use std::sync::Arc;

use super::sink::{DiscardingSink, FinalSink};
use crate::aggregation::{AggregateValue, AggregatorRegistry, ConvergenceCriterion, MergeFn};
use crate::config::IterationConfig;
use crate::execution::{EdgeDescriptors, MatchFunction, SolutionSetJoinFunction, StageSpec};
use crate::record::Record;

/// User logic of an iterative scope
#[derive(Clone)]
pub struct IterationProgram {
    pub name: String,
    pub head: Arc<dyn MatchFunction>,
    pub intermediates: Vec<StageSpec>,
    pub solution_set_join: Arc<dyn SolutionSetJoinFunction>,
    pub aggregators: AggregatorRegistry,
    pub convergence: ConvergenceCriterion,
}

impl fmt::Debug for IterationProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationProgram")
            .field("name", &self.name)
            .field("intermediates", &self.intermediates)
            .field("aggregators", &self.aggregators.names().collect::<Vec<_>>())
            .field("convergence", &self.convergence)
            .finish()
    }
}

impl IterationProgram {
    pub fn new(
        name: impl Into<String>,
        head: Arc<dyn MatchFunction>,
        solution_set_join: Arc<dyn SolutionSetJoinFunction>,
    ) -> Self {
        Self {
            name: name.into(),
            head,
            intermediates: Vec::new(),
            solution_set_join,
            aggregators: AggregatorRegistry::with_builtins(),
            convergence: ConvergenceCriterion::WorksetEmpty,
        }
    }

    pub fn with_intermediate(mut self, stage: StageSpec) -> Self {
        self.intermediates.push(stage);
        self
    }

    pub fn with_aggregator(
        mut self,
        name: impl Into<String>,
        initial: AggregateValue,
        merge: MergeFn,
    ) -> Self {
        self.aggregators = self.aggregators.register(name, initial, merge);
        self
    }

    pub fn with_convergence(mut self, convergence: ConvergenceCriterion) -> Self {
        self.convergence = convergence;
        self
    }
}

/// Everything the runtime needs to execute one iterative scope
#[derive(Clone)]
pub struct IterationJob {
    pub config: IterationConfig,
    pub program: IterationProgram,
    pub solution_set: Vec<Record>,
    pub workset: Vec<Record>,
    pub invariant: Vec<Record>,
    pub edges: EdgeDescriptors,
    pub sink: Arc<dyn FinalSink>,
}

impl fmt::Debug for IterationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationJob")
            .field("config", &self.config)
            .field("program", &self.program)
            .field("solution_set", &self.solution_set.len())
            .field("workset", &self.workset.len())
            .field("invariant", &self.invariant.len())
            .field("edges", &self.edges)
            .finish()
    }
}

impl IterationJob {
    pub fn new(config: IterationConfig, program: IterationProgram) -> Self {
        Self {
            config,
            program,
            solution_set: Vec::new(),
            workset: Vec::new(),
            invariant: Vec::new(),
            edges: EdgeDescriptors::default(),
            sink: Arc::new(DiscardingSink),
        }
    }

    pub fn with_solution_set(mut self, records: Vec<Record>) -> Self {
        self.solution_set = records;
        self
    }

    pub fn with_workset(mut self, records: Vec<Record>) -> Self {
        self.workset = records;
        self
    }

    pub fn with_invariant(mut self, records: Vec<Record>) -> Self {
        self.invariant = records;
        self
    }

    pub fn with_edges(mut self, edges: EdgeDescriptors) -> Self {
        self.edges = edges;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn FinalSink>) -> Self {
        self.sink = sink;
        self
    }
}
