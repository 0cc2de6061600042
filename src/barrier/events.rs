use serde::{Deserialize, Serialize};

/// Events that drive barrier state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BarrierEvent {
    /// Every head instance reported the current superstep
    AllHeadsReported,
    /// Aggregator contributions were merged
    AggregatesMerged,
    /// The convergence criterion fired
    Converged,
    /// The superstep bound was reached without convergence
    MaxSuperstepsReached,
    /// Neither condition fired
    Continue,
    /// The continue decision was broadcast; start the next superstep
    NextSuperstep,
    /// Tear the scope down with the given reason
    Abort(String),
}

impl BarrierEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AllHeadsReported => "all_heads_reported",
            Self::AggregatesMerged => "aggregates_merged",
            Self::Converged => "converged",
            Self::MaxSuperstepsReached => "max_supersteps_reached",
            Self::Continue => "continue",
            Self::NextSuperstep => "next_superstep",
            Self::Abort(_) => "abort",
        }
    }

    /// Extract the abort reason
    pub fn abort_reason(&self) -> Option<&str> {
        match self {
            Self::Abort(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn abort_with_reason(reason: impl Into<String>) -> Self {
        Self::Abort(reason.into())
    }
}
