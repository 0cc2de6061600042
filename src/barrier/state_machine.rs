use tracing::debug;

use super::events::BarrierEvent;
use super::states::{BarrierState, TerminationCause};
use crate::error::{IterationError, Result};

/// Transition table of the synchronization barrier
#[derive(Debug, Clone)]
pub struct BarrierStateMachine {
    iteration_id: u32,
    state: BarrierState,
    superstep: u32,
    cause: Option<TerminationCause>,
}

impl BarrierStateMachine {
    pub fn new(iteration_id: u32) -> Self {
        Self {
            iteration_id,
            state: BarrierState::default(),
            superstep: 1,
            cause: None,
        }
    }

    pub fn current_state(&self) -> BarrierState {
        self.state
    }

    /// The superstep whose reports the barrier is collecting or deciding
    pub fn superstep(&self) -> u32 {
        self.superstep
    }

    /// Set once the machine has reached `Terminating`
    pub fn termination_cause(&self) -> Option<TerminationCause> {
        self.cause
    }

    /// Apply an event, returning the new state
    pub fn transition(&mut self, event: BarrierEvent) -> Result<BarrierState> {
        let target = self.determine_target_state(&event)?;
        debug!(
            iteration_id = self.iteration_id,
            superstep = self.superstep,
            from = %self.state,
            to = %target,
            event = event.event_type(),
            "🚧 BARRIER: transition"
        );

        match (&event, target) {
            (BarrierEvent::NextSuperstep, _) => self.superstep += 1,
            (BarrierEvent::Converged, _) => self.cause = Some(TerminationCause::Converged),
            (BarrierEvent::MaxSuperstepsReached, _) => {
                self.cause = Some(TerminationCause::MaxSuperstepsReached)
            }
            (BarrierEvent::Abort(_), _) => self.cause = Some(TerminationCause::Aborted),
            _ => {}
        }
        self.state = target;
        Ok(target)
    }

    fn determine_target_state(&self, event: &BarrierEvent) -> Result<BarrierState> {
        let target = match (self.state, event) {
            (BarrierState::AwaitingHeads, BarrierEvent::AllHeadsReported) => {
                BarrierState::Aggregating
            }
            (BarrierState::Aggregating, BarrierEvent::AggregatesMerged) => {
                BarrierState::EvaluatingConvergence
            }

            // Decisions
            (BarrierState::EvaluatingConvergence, BarrierEvent::Converged) => {
                BarrierState::Terminating
            }
            (BarrierState::EvaluatingConvergence, BarrierEvent::MaxSuperstepsReached) => {
                BarrierState::Terminating
            }
            (BarrierState::EvaluatingConvergence, BarrierEvent::Continue) => {
                BarrierState::Continuing
            }
            (BarrierState::Continuing, BarrierEvent::NextSuperstep) => BarrierState::AwaitingHeads,

            // Abort from anywhere but the terminal state
            (from_state, BarrierEvent::Abort(_)) if !from_state.is_terminal() => {
                BarrierState::Terminating
            }

            (from_state, _) => {
                return Err(IterationError::InvalidBarrierTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }
}
