//! # Tail Wirings and Execution Plans
//!
//! A program supplies its intermediate stages and a solution-set join function; the wiring
//! decides where the two tail capabilities (solution-set commit, workset production) are
//! attached. All four wirings compose the same primitives and produce the same results.
//!
//! The solution-set join probes only its own partition's store, so with more than one
//! partition the path from the head to the join must cross a `PartitionHash` or
//! `Broadcast` edge. Plans that never repartition are rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::channels::{EdgeDescriptor, EdgeDescriptors, ShipStrategy};
use super::drivers::{Driver, KeyRouting, LocalStrategy};
use super::functions::{MapFunction, ReduceFunction, SolutionSetJoinFunction};
use crate::config::{ConfigResult, ConfigurationError, IterationConfig};
use crate::record::Partitioner;

pub const SOLUTION_SET_JOIN_STAGE: &str = "Solution Set Join";
pub const SOLUTION_SET_TAIL_STAGE: &str = "Solution Set Tail";
pub const WORKSET_TAIL_STAGE: &str = "Workset Tail";

/// Where the solution-set commit and the workset production happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailWiring {
    /// One solution-set-join tail commits and produces the workset
    #[default]
    Unified,
    /// The join fans out to an identity commit tail and an identity workset tail
    SeparateTails,
    /// The join produces the workset and forwards to an identity commit tail
    IntermediateWorksetUpdate,
    /// The join commits and forwards to an identity workset tail
    IntermediateSolutionSetUpdate,
}

impl TailWiring {
    pub const ALL: [TailWiring; 4] = [
        Self::Unified,
        Self::SeparateTails,
        Self::IntermediateWorksetUpdate,
        Self::IntermediateSolutionSetUpdate,
    ];

    /// Whether the commit can finish after the back-channel closes, so the head must wait
    /// for the commit acknowledgement before reporting the superstep.
    pub fn requires_commit_acknowledgement(&self) -> bool {
        matches!(self, Self::SeparateTails | Self::IntermediateWorksetUpdate)
    }

    pub fn default_head_mode(&self) -> HeadMode {
        if self.requires_commit_acknowledgement() {
            HeadMode::WaitForSolutionSetUpdate
        } else {
            HeadMode::FireAndForget
        }
    }

    /// Committing with the join's own probe result makes the reprobe redundant
    pub fn default_without_reprobe(&self) -> bool {
        matches!(self, Self::Unified | Self::IntermediateSolutionSetUpdate)
    }
}

impl fmt::Display for TailWiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unified => write!(f, "unified"),
            Self::SeparateTails => write!(f, "separate_tails"),
            Self::IntermediateWorksetUpdate => write!(f, "intermediate_workset_update"),
            Self::IntermediateSolutionSetUpdate => write!(f, "intermediate_solution_set_update"),
        }
    }
}

impl std::str::FromStr for TailWiring {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unified" => Ok(Self::Unified),
            "separate_tails" => Ok(Self::SeparateTails),
            "intermediate_workset_update" => Ok(Self::IntermediateWorksetUpdate),
            "intermediate_solution_set_update" => Ok(Self::IntermediateSolutionSetUpdate),
            _ => Err(format!("Invalid tail wiring: {s}")),
        }
    }
}

/// Whether the head waits for the solution-set commit of its superstep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadMode {
    FireAndForget,
    WaitForSolutionSetUpdate,
}

impl fmt::Display for HeadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FireAndForget => write!(f, "fire_and_forget"),
            Self::WaitForSolutionSetUpdate => write!(f, "wait_for_solution_set_update"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Intermediate,
    Tail,
}

/// Upstream of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
    Head,
    Stage(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageCapabilities {
    /// Emitted records are written to the back-channel as the next workset
    pub workset_update: bool,
    /// Emitted records are committed to the solution set
    pub solution_set_update: bool,
}

/// One stage of the superstep pipeline
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub driver: Driver,
    pub local_strategy: LocalStrategy,
    /// Edge into this stage; filled from the plan defaults when unset
    pub edge: Option<EdgeDescriptor>,
    pub role: StageRole,
    pub input: StageInput,
    pub capabilities: StageCapabilities,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, driver: Driver) -> Self {
        Self {
            name: name.into(),
            driver,
            local_strategy: LocalStrategy::None,
            edge: None,
            role: StageRole::Intermediate,
            input: StageInput::Head,
            capabilities: StageCapabilities::default(),
        }
    }

    pub fn map(name: impl Into<String>, function: Arc<dyn MapFunction>) -> Self {
        Self::new(name, Driver::Map(function))
    }

    /// Group-by-key reduction over sorted input
    pub fn reduce(name: impl Into<String>, function: Arc<dyn ReduceFunction>) -> Self {
        Self::new(name, Driver::Reduce(function)).with_local_strategy(LocalStrategy::Sort)
    }

    pub fn solution_set_join(
        name: impl Into<String>,
        function: Arc<dyn SolutionSetJoinFunction>,
    ) -> Self {
        Self::new(name, Driver::SolutionSetJoin(function))
    }

    pub fn with_local_strategy(mut self, local_strategy: LocalStrategy) -> Self {
        self.local_strategy = local_strategy;
        self
    }

    pub fn with_edge(mut self, edge: EdgeDescriptor) -> Self {
        self.edge = Some(edge);
        self
    }

    fn attached(
        mut self,
        role: StageRole,
        input: StageInput,
        capabilities: StageCapabilities,
    ) -> Self {
        self.role = role;
        self.input = input;
        self.capabilities = capabilities;
        self
    }

    /// Edge into the stage; plans always resolve it
    pub fn input_edge(&self) -> EdgeDescriptor {
        self.edge.unwrap_or_else(EdgeDescriptor::forward)
    }
}

/// The stages of a superstep with their edges and capabilities resolved
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub wiring: TailWiring,
    pub head_mode: HeadMode,
    pub without_reprobe: bool,
    pub parallelism: usize,
    pub stages: Vec<StageSpec>,
}

impl ExecutionPlan {
    /// Attach the solution-set join and tails for the configured wiring after the
    /// program's intermediates.
    pub fn compose(
        config: &IterationConfig,
        intermediates: Vec<StageSpec>,
        join: Arc<dyn SolutionSetJoinFunction>,
        edges: EdgeDescriptors,
    ) -> ConfigResult<Self> {
        let mut stages: Vec<StageSpec> = intermediates
            .into_iter()
            .enumerate()
            .map(|(index, stage)| {
                let input = match index {
                    0 => StageInput::Head,
                    n => StageInput::Stage(n - 1),
                };
                stage.attached(StageRole::Intermediate, input, StageCapabilities::default())
            })
            .collect();

        let join_input = match stages.len() {
            0 => StageInput::Head,
            n => StageInput::Stage(n - 1),
        };
        let join_stage = StageSpec::solution_set_join(SOLUTION_SET_JOIN_STAGE, join);
        let commit = StageCapabilities {
            solution_set_update: true,
            workset_update: false,
        };
        let produce = StageCapabilities {
            solution_set_update: false,
            workset_update: true,
        };

        match config.wiring {
            TailWiring::Unified => {
                stages.push(join_stage.attached(
                    StageRole::Tail,
                    join_input,
                    StageCapabilities {
                        solution_set_update: true,
                        workset_update: true,
                    },
                ));
            }
            TailWiring::SeparateTails => {
                let join_index = stages.len();
                stages.push(join_stage.attached(
                    StageRole::Intermediate,
                    join_input,
                    StageCapabilities::default(),
                ));
                stages.push(identity_tail(SOLUTION_SET_TAIL_STAGE, join_index, commit));
                stages.push(identity_tail(WORKSET_TAIL_STAGE, join_index, produce));
            }
            TailWiring::IntermediateWorksetUpdate => {
                let join_index = stages.len();
                stages.push(join_stage.attached(StageRole::Intermediate, join_input, produce));
                stages.push(identity_tail(SOLUTION_SET_TAIL_STAGE, join_index, commit));
            }
            TailWiring::IntermediateSolutionSetUpdate => {
                let join_index = stages.len();
                stages.push(join_stage.attached(StageRole::Intermediate, join_input, commit));
                stages.push(identity_tail(WORKSET_TAIL_STAGE, join_index, produce));
            }
        }

        for stage in &mut stages {
            if stage.edge.is_none() {
                stage.edge = Some(match stage.input {
                    StageInput::Head => edges.head_output,
                    StageInput::Stage(_) => edges.stage_output,
                });
            }
        }

        let plan = Self {
            wiring: config.wiring,
            head_mode: config.effective_head_mode(),
            without_reprobe: config.effective_without_reprobe(),
            parallelism: config.parallelism,
            stages,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Stages reading from `input`
    pub fn consumers(&self, input: StageInput) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| stage.input == input)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn workset_producers(&self) -> Vec<usize> {
        self.capable(|capabilities| capabilities.workset_update)
    }

    pub fn committers(&self) -> Vec<usize> {
        self.capable(|capabilities| capabilities.solution_set_update)
    }

    /// How the input keys of stage `index` relate to the partition running it
    pub fn key_routing(&self, index: usize) -> KeyRouting {
        let partitioner = Partitioner::new(self.parallelism);
        match self.repartitioning_into(index) {
            Some(ShipStrategy::Broadcast) => KeyRouting::Replicated(partitioner),
            _ => KeyRouting::Owned(partitioner),
        }
    }

    /// Ship strategy of the nearest edge at or above stage `index` that moves records
    /// between partitions; `None` when every edge back to the head is `Forward`.
    fn repartitioning_into(&self, index: usize) -> Option<ShipStrategy> {
        let mut current = index;
        loop {
            let stage = self.stages.get(current)?;
            let strategy = stage.input_edge().ship_strategy;
            if strategy != ShipStrategy::Forward {
                return Some(strategy);
            }
            match stage.input {
                StageInput::Head => return None,
                StageInput::Stage(upstream) if upstream < current => current = upstream,
                StageInput::Stage(_) => return None,
            }
        }
    }

    fn solution_set_joins(&self) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| matches!(stage.driver, Driver::SolutionSetJoin(_)))
            .map(|(index, _)| index)
            .collect()
    }

    fn capable(&self, predicate: impl Fn(&StageCapabilities) -> bool) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| predicate(&stage.capabilities))
            .map(|(index, _)| index)
            .collect()
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.workset_producers().len() != 1 {
            return Err(ConfigurationError::validation_error(format!(
                "wiring '{}' must have exactly one workset producer",
                self.wiring
            )));
        }
        if self.committers().len() != 1 {
            return Err(ConfigurationError::validation_error(format!(
                "wiring '{}' must have exactly one solution-set committer",
                self.wiring
            )));
        }
        if self.consumers(StageInput::Head).is_empty() {
            return Err(ConfigurationError::validation_error(
                "no stage consumes the head output",
            ));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if let StageInput::Stage(upstream) = stage.input {
                if upstream >= index {
                    return Err(ConfigurationError::validation_error(format!(
                        "stage '{}' reads from a later stage",
                        stage.name
                    )));
                }
            }
            if matches!(stage.driver, Driver::Reduce(_)) && !stage.local_strategy.groups_keys() {
                return Err(ConfigurationError::invalid_value(
                    "local_strategy",
                    format!("{:?}", stage.local_strategy),
                    format!("reduce stage '{}' needs key-grouped input", stage.name),
                ));
            }
            let has_consumers = !self.consumers(StageInput::Stage(index)).is_empty();
            match (stage.role, has_consumers) {
                (StageRole::Tail, true) => {
                    return Err(ConfigurationError::validation_error(format!(
                        "tail '{}' has downstream consumers",
                        stage.name
                    )))
                }
                (StageRole::Intermediate, false) => {
                    return Err(ConfigurationError::validation_error(format!(
                        "intermediate '{}' has no downstream consumers",
                        stage.name
                    )))
                }
                _ => {}
            }
        }
        self.validate_routing()
    }

    /// Joins must see each key on its owning partition, and the tails behind a join must
    /// keep its output there.
    fn validate_routing(&self) -> ConfigResult<()> {
        let joins = self.solution_set_joins();
        if self.parallelism > 1 {
            for &join in &joins {
                if self.repartitioning_into(join).is_none() {
                    return Err(ConfigurationError::validation_error(format!(
                        "'{}' receives head output over forward edges only; with parallelism {} \
                         an edge before it must be partition_hash or broadcast",
                        self.stages[join].name, self.parallelism
                    )));
                }
            }
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if joins.contains(&index) {
                continue;
            }
            let capable = stage.capabilities.solution_set_update || stage.capabilities.workset_update;
            if capable && self.broadcast_after_join(index) {
                return Err(ConfigurationError::validation_error(format!(
                    "'{}' commits or produces the workset behind a broadcast edge",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Whether a broadcast edge lies between stage `index` and the join feeding it
    fn broadcast_after_join(&self, index: usize) -> bool {
        let mut current = index;
        while let Some(stage) = self.stages.get(current) {
            if matches!(stage.driver, Driver::SolutionSetJoin(_)) {
                return false;
            }
            if stage.input_edge().ship_strategy == ShipStrategy::Broadcast {
                return true;
            }
            match stage.input {
                StageInput::Stage(upstream) if upstream < current => current = upstream,
                _ => return false,
            }
        }
        false
    }
}

fn identity_tail(name: &str, upstream: usize, capabilities: StageCapabilities) -> StageSpec {
    StageSpec::new(name, Driver::identity()).attached(
        StageRole::Tail,
        StageInput::Stage(upstream),
        capabilities,
    )
}
