use serde::{Deserialize, Serialize};
use std::fmt;

/// Barrier state for one superstep of an iterative scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    /// Waiting for every head instance to report the superstep
    AwaitingHeads,
    /// Merging the per-partition aggregator contributions
    Aggregating,
    /// Applying the convergence criterion and the superstep bound
    EvaluatingConvergence,
    /// Decided to run another superstep
    Continuing,
    /// Decided to stop; no further transitions
    Terminating,
}

impl BarrierState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminating)
    }

    /// Check if the barrier is still inside a superstep's decision
    pub fn is_deciding(&self) -> bool {
        matches!(self, Self::Aggregating | Self::EvaluatingConvergence)
    }
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingHeads => write!(f, "awaiting_heads"),
            Self::Aggregating => write!(f, "aggregating"),
            Self::EvaluatingConvergence => write!(f, "evaluating_convergence"),
            Self::Continuing => write!(f, "continuing"),
            Self::Terminating => write!(f, "terminating"),
        }
    }
}

impl std::str::FromStr for BarrierState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_heads" => Ok(Self::AwaitingHeads),
            "aggregating" => Ok(Self::Aggregating),
            "evaluating_convergence" => Ok(Self::EvaluatingConvergence),
            "continuing" => Ok(Self::Continuing),
            "terminating" => Ok(Self::Terminating),
            _ => Err(format!("Invalid barrier state: {s}")),
        }
    }
}

impl Default for BarrierState {
    fn default() -> Self {
        Self::AwaitingHeads
    }
}

/// Why an iterative scope stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// The convergence criterion fired
    Converged,
    /// The superstep bound was exhausted first; a normal termination
    MaxSuperstepsReached,
    /// A task failed and the scope was torn down
    Aborted,
}

impl TerminationCause {
    pub fn is_normal(&self) -> bool {
        !matches!(self, Self::Aborted)
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::MaxSuperstepsReached => write!(f, "max_supersteps_reached"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_check() {
        assert!(BarrierState::Terminating.is_terminal());
        assert!(!BarrierState::Continuing.is_terminal());
        assert!(!BarrierState::AwaitingHeads.is_terminal());
        assert!(BarrierState::Aggregating.is_deciding());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(
            BarrierState::EvaluatingConvergence.to_string(),
            "evaluating_convergence"
        );
        assert_eq!(
            "awaiting_heads".parse::<BarrierState>().unwrap(),
            BarrierState::AwaitingHeads
        );
        assert!("sleeping".parse::<BarrierState>().is_err());
    }

    #[test]
    fn test_cause_serde() {
        let json = serde_json::to_string(&TerminationCause::MaxSuperstepsReached).unwrap();
        assert_eq!(json, "\"max_supersteps_reached\"");
        assert!(!TerminationCause::Aborted.is_normal());
    }
}
