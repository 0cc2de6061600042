//! # Iteration Error Types
//!
//! Every failure inside an iterative scope is fatal to the scope: errors propagate from the
//! failing task to the runtime, which aborts all remaining tasks and releases partition
//! resources. There is no partial-iteration recovery.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigurationError;
use crate::record::Key;

/// Errors raised by the iteration runtime
#[derive(Error, Debug)]
pub enum IterationError {
    #[error("Store capacity exceeded in partition {partition}: record for key {key} needs {size_bytes} bytes, limit is {limit_bytes} bytes")]
    StoreCapacityExceeded {
        partition: usize,
        key: Key,
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Spill I/O failure during {operation} on {path:?} after {attempts} attempts: {source}")]
    SpillIoFailure {
        operation: &'static str,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Back-channel protocol violation on iteration {iteration_id} partition {partition} superstep {superstep}: {message}")]
    BackChannelProtocolViolation {
        iteration_id: u32,
        partition: usize,
        superstep: u32,
        message: String,
    },

    #[error("Barrier timeout: {reported} of {expected} heads reported for superstep {superstep} within {timeout_ms}ms")]
    BarrierTimeout {
        superstep: u32,
        reported: usize,
        expected: usize,
        timeout_ms: u64,
    },

    #[error("User function failed in stage '{stage}' for key {key:?} at superstep {superstep}: {message}")]
    UserFunction {
        stage: String,
        key: Option<Key>,
        superstep: u32,
        message: String,
    },

    #[error("Record for key {key} reached stage '{stage}' in partition {partition} at superstep {superstep}, but partition {owner} owns that key")]
    MisroutedRecord {
        stage: String,
        key: Key,
        partition: usize,
        owner: usize,
        superstep: u32,
    },

    #[error("Unknown solution set key {key} in partition {partition}: keys can only be created during build")]
    UnknownSolutionSetKey { partition: usize, key: Key },

    #[error("Solution set of partition {partition} has not been built")]
    SolutionSetNotBuilt { partition: usize },

    #[error("Reprobe mismatch for key {key} in partition {partition}: committed value was not read back")]
    ReprobeMismatch { partition: usize, key: Key },

    #[error("Aggregator '{name}': {message}")]
    Aggregator { name: String, message: String },

    #[error("Invalid barrier transition from {from} on {event}")]
    InvalidBarrierTransition { from: String, event: String },

    #[error("Barrier protocol error at superstep {superstep}: {message}")]
    BarrierProtocol { superstep: u32, message: String },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    #[error("Iterative scope {iteration_id} aborted")]
    ScopeAborted { iteration_id: u32 },

    #[error("Record codec error: {message}")]
    Codec { message: String },

    #[error("Task join error: {message}")]
    TaskJoin { message: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl IterationError {
    /// Wrap a failure raised by a user-supplied record function
    pub fn user_function(
        stage: impl Into<String>,
        key: Option<Key>,
        superstep: u32,
        error: &anyhow::Error,
    ) -> Self {
        Self::UserFunction {
            stage: stage.into(),
            key,
            superstep,
            message: format!("{error:#}"),
        }
    }

    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: channel.into(),
        }
    }

    /// Whether this error is a consequence of another task aborting the scope
    /// rather than a root cause.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::ScopeAborted { .. } | Self::ChannelClosed { .. })
    }
}

impl From<serde_json::Error> for IterationError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec {
            message: error.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IterationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_function_error_carries_key_and_superstep() {
        let err = IterationError::user_function(
            "Find Min Component-ID",
            Some(42),
            7,
            &anyhow::anyhow!("boom"),
        );
        let message = err.to_string();
        assert!(message.contains("Some(42)"));
        assert!(message.contains("superstep 7"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_secondary_errors() {
        assert!(IterationError::ScopeAborted { iteration_id: 1 }.is_secondary());
        assert!(IterationError::channel_closed("head->reduce").is_secondary());
        assert!(!IterationError::BarrierTimeout {
            superstep: 1,
            reported: 3,
            expected: 4,
            timeout_ms: 10
        }
        .is_secondary());
    }
}
