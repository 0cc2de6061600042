//! # Superstep Execution
//!
//! The task roles of an iterative scope and the edges between them.
//!
//! - [`head`]: builds the solution set, joins the workset with the invariant input
//! - [`stage`]: intermediates and tails, driven by a [`drivers::Driver`]
//! - [`wiring`]: the four tail wirings and the execution plan they compose
//! - [`channels`]: bounded edges with ship strategies and input gates
//! - [`latch`]: commit acknowledgements for wait-for-update heads

pub mod channels;
pub mod drivers;
pub mod functions;
pub mod head;
pub mod latch;
pub mod message;
pub mod stage;
pub mod wiring;

pub use channels::{EdgeDescriptor, EdgeDescriptors, InputGate, OutputEmitter, ShipStrategy, Transport};
pub use drivers::{Driver, KeyRouting, LocalStrategy};
pub use functions::{
    map_fn, match_fn, reduce_fn, solution_set_join_fn, Collector, FunctionContext, IdentityMap,
    MapFunction, MatchFunction, ReduceFunction, SolutionSetJoinFunction,
};
pub use head::{HeadCompletion, HeadInputs, HeadSummary, HeadTask};
pub use latch::SolutionSetUpdateLatch;
pub use message::{Payload, StageMessage};
pub use stage::{StageSummary, StageTask};
pub use wiring::{
    ExecutionPlan, HeadMode, StageCapabilities, StageInput, StageRole, StageSpec, TailWiring,
};
