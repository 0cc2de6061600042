//! # Synchronization Barrier
//!
//! Scope-wide rendezvous run once per superstep. Every head reports its partition's
//! aggregator snapshot; once all `parallelism` reports for the superstep have arrived the
//! barrier merges them, evaluates convergence and the superstep bound, and broadcasts the
//! decision. Heads start superstep `n + 1` only after reading a `Continue` for `n`, so no
//! partition sees the next superstep's input before every contribution of the current one
//! has been merged.
//!
//! Reports travel over a bounded mpsc channel; decisions are published on a `watch` channel
//! tagged with the superstep they answer.

pub mod events;
pub mod state_machine;
pub mod states;

pub use events::BarrierEvent;
pub use state_machine::BarrierStateMachine;
pub use states::{BarrierState, TerminationCause};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::aggregation::{Aggregates, AggregatorRegistry, ConvergenceCriterion};
use crate::config::IterationConfig;
use crate::constants::events as lifecycle;
use crate::error::{IterationError, Result};
use crate::logging::log_superstep_operation;

/// A head's end-of-superstep contribution
#[derive(Debug, Clone)]
pub struct HeadReport {
    pub partition: usize,
    pub superstep: u32,
    pub aggregates: Aggregates,
}

/// What the heads do after a superstep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierDecision {
    Continue,
    Terminate(TerminationCause),
}

impl fmt::Display for BarrierDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Terminate(cause) => write!(f, "terminate({cause})"),
        }
    }
}

/// Merged aggregates and the decision taken for one superstep
#[derive(Debug, Clone, Serialize)]
pub struct SuperstepSummary {
    pub superstep: u32,
    pub aggregates: Aggregates,
    pub decision: BarrierDecision,
    pub decided_at: DateTime<Utc>,
}

/// Final result of a barrier run
#[derive(Debug, Clone)]
pub struct BarrierOutcome {
    pub cause: TerminationCause,
    /// Number of supersteps executed
    pub supersteps: u32,
    pub summaries: Vec<SuperstepSummary>,
}

#[derive(Debug, Clone)]
pub struct BarrierSettings {
    pub iteration_id: u32,
    pub parallelism: usize,
    pub max_supersteps: u32,
    pub timeout: Duration,
}

impl BarrierSettings {
    pub fn from_config(config: &IterationConfig) -> Self {
        Self {
            iteration_id: config.iteration_id,
            parallelism: config.parallelism,
            max_supersteps: config.max_supersteps,
            timeout: config.barrier_timeout(),
        }
    }
}

type Published = Option<(u32, BarrierDecision)>;

/// Head-side endpoint of the barrier
#[derive(Debug, Clone)]
pub struct BarrierHandle {
    reports: mpsc::Sender<HeadReport>,
    decisions: watch::Receiver<Published>,
}

impl BarrierHandle {
    pub async fn report(&self, report: HeadReport) -> Result<()> {
        self.reports
            .send(report)
            .await
            .map_err(|_| IterationError::channel_closed("barrier reports"))
    }

    /// Wait for the decision on `superstep`. An abort is returned whatever superstep it was
    /// published for.
    pub async fn decision(&mut self, superstep: u32) -> Result<BarrierDecision> {
        let published = self
            .decisions
            .wait_for(|published| match published {
                Some((decided, _)) if *decided >= superstep => true,
                Some((_, BarrierDecision::Terminate(TerminationCause::Aborted))) => true,
                _ => false,
            })
            .await
            .map_err(|_| IterationError::channel_closed("barrier decisions"))?;
        match *published {
            Some((_, decision)) => Ok(decision),
            None => Err(IterationError::channel_closed("barrier decisions")),
        }
    }

    /// Latest published decision, without waiting
    pub fn latest(&self) -> Published {
        *self.decisions.borrow()
    }
}

/// The barrier task of one iterative scope
pub struct SyncBarrier {
    settings: BarrierSettings,
    registry: Arc<AggregatorRegistry>,
    criterion: ConvergenceCriterion,
    machine: BarrierStateMachine,
    reports: mpsc::Receiver<HeadReport>,
    decisions: watch::Sender<Published>,
    summaries: Vec<SuperstepSummary>,
}

impl fmt::Debug for SyncBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncBarrier")
            .field("settings", &self.settings)
            .field("criterion", &self.criterion)
            .field("state", &self.machine.current_state())
            .field("superstep", &self.machine.superstep())
            .finish()
    }
}

impl SyncBarrier {
    pub fn new(
        settings: BarrierSettings,
        registry: Arc<AggregatorRegistry>,
        criterion: ConvergenceCriterion,
    ) -> (Self, BarrierHandle) {
        let (report_tx, report_rx) = mpsc::channel(settings.parallelism.max(1));
        let (decision_tx, decision_rx) = watch::channel(None);
        let machine = BarrierStateMachine::new(settings.iteration_id);
        let barrier = Self {
            settings,
            registry,
            criterion,
            machine,
            reports: report_rx,
            decisions: decision_tx,
            summaries: Vec::new(),
        };
        let handle = BarrierHandle {
            reports: report_tx,
            decisions: decision_rx,
        };
        (barrier, handle)
    }

    pub fn state(&self) -> BarrierState {
        self.machine.current_state()
    }

    /// Drive supersteps until termination. On failure the heads are told to abort before
    /// the error is returned.
    pub async fn run(mut self) -> Result<BarrierOutcome> {
        match self.run_supersteps().await {
            Ok(cause) => Ok(BarrierOutcome {
                cause,
                supersteps: self.machine.superstep(),
                summaries: self.summaries,
            }),
            Err(error) => {
                self.abort(&error.to_string());
                Err(error)
            }
        }
    }

    /// Broadcast termination to every head
    pub fn abort(&mut self, reason: &str) {
        let superstep = self.machine.superstep();
        if !self.machine.current_state().is_terminal() {
            // Only fails from the terminal state, excluded above
            let _ = self
                .machine
                .transition(BarrierEvent::abort_with_reason(reason));
        }
        warn!(
            iteration_id = self.settings.iteration_id,
            superstep = superstep,
            reason = %reason,
            "🛑 BARRIER: aborting scope"
        );
        self.decisions.send_replace(Some((
            superstep,
            BarrierDecision::Terminate(TerminationCause::Aborted),
        )));
    }

    async fn run_supersteps(&mut self) -> Result<TerminationCause> {
        loop {
            let superstep = self.machine.superstep();
            let reports = self.collect(superstep).await?;
            self.machine.transition(BarrierEvent::AllHeadsReported)?;

            let merged = self.registry.merge_all(reports.values())?;
            self.machine.transition(BarrierEvent::AggregatesMerged)?;

            // Convergence takes precedence when the bound is reached in the same superstep
            let event = if self.criterion.is_converged(&merged) {
                BarrierEvent::Converged
            } else if superstep >= self.settings.max_supersteps {
                BarrierEvent::MaxSuperstepsReached
            } else {
                BarrierEvent::Continue
            };
            self.machine.transition(event)?;

            let decision = match self.machine.termination_cause() {
                Some(cause) => BarrierDecision::Terminate(cause),
                None => BarrierDecision::Continue,
            };
            log_superstep_operation(
                lifecycle::SUPERSTEP_DECIDED,
                self.settings.iteration_id,
                superstep,
                None,
                "barrier",
                Some(&format!("decision={decision}")),
            );
            self.summaries.push(SuperstepSummary {
                superstep,
                aggregates: merged,
                decision,
                decided_at: Utc::now(),
            });
            self.decisions.send_replace(Some((superstep, decision)));

            match decision {
                BarrierDecision::Terminate(cause) => {
                    info!(
                        iteration_id = self.settings.iteration_id,
                        superstep = superstep,
                        cause = %cause,
                        "🏁 BARRIER: scope terminating"
                    );
                    return Ok(cause);
                }
                BarrierDecision::Continue => {
                    self.machine.transition(BarrierEvent::NextSuperstep)?;
                }
            }
        }
    }

    async fn collect(&mut self, superstep: u32) -> Result<BTreeMap<usize, Aggregates>> {
        let expected = self.settings.parallelism;
        let deadline = tokio::time::Instant::now() + self.settings.timeout;
        let mut reports = BTreeMap::new();

        while reports.len() < expected {
            let report = match tokio::time::timeout_at(deadline, self.reports.recv()).await {
                Ok(Some(report)) => report,
                Ok(None) => return Err(IterationError::channel_closed("barrier reports")),
                Err(_) => {
                    return Err(IterationError::BarrierTimeout {
                        superstep,
                        reported: reports.len(),
                        expected,
                        timeout_ms: self.settings.timeout.as_millis() as u64,
                    })
                }
            };

            if report.superstep != superstep {
                return Err(IterationError::BarrierProtocol {
                    superstep,
                    message: format!(
                        "partition {} reported superstep {}",
                        report.partition, report.superstep
                    ),
                });
            }
            if report.partition >= expected {
                return Err(IterationError::BarrierProtocol {
                    superstep,
                    message: format!("unknown partition {}", report.partition),
                });
            }
            if reports.insert(report.partition, report.aggregates).is_some() {
                return Err(IterationError::BarrierProtocol {
                    superstep,
                    message: format!("duplicate report from partition {}", report.partition),
                });
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregateValue;
    use crate::constants::aggregators::WORKSET_SIZE;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn settings(parallelism: usize, max_supersteps: u32, timeout_ms: u64) -> BarrierSettings {
        BarrierSettings {
            iteration_id: 1,
            parallelism,
            max_supersteps,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn report(partition: usize, superstep: u32, workset: i64) -> HeadReport {
        let mut aggregates = AggregatorRegistry::with_builtins().initial_values();
        aggregates.insert(WORKSET_SIZE.into(), AggregateValue::Long(workset));
        HeadReport {
            partition,
            superstep,
            aggregates,
        }
    }

    #[tokio::test]
    async fn test_continue_until_workset_empty() {
        let (barrier, mut handle) = SyncBarrier::new(
            settings(2, 10, 1_000),
            Arc::new(AggregatorRegistry::with_builtins()),
            ConvergenceCriterion::WorksetEmpty,
        );
        let barrier = tokio::spawn(barrier.run());

        handle.report(report(0, 1, 3)).await.unwrap();
        handle.report(report(1, 1, 0)).await.unwrap();
        assert_eq!(handle.decision(1).await.unwrap(), BarrierDecision::Continue);

        handle.report(report(1, 2, 0)).await.unwrap();
        handle.report(report(0, 2, 0)).await.unwrap();
        assert_eq!(
            handle.decision(2).await.unwrap(),
            BarrierDecision::Terminate(TerminationCause::Converged)
        );

        let outcome = barrier.await.unwrap().unwrap();
        assert_eq!(outcome.cause, TerminationCause::Converged);
        assert_eq!(outcome.supersteps, 2);
        assert_eq!(
            outcome.summaries[0].aggregates[WORKSET_SIZE],
            AggregateValue::Long(3)
        );
    }

    #[tokio::test]
    async fn test_no_decision_before_every_head_reports() {
        let (barrier, handle) = SyncBarrier::new(
            settings(3, 10, 1_000),
            Arc::new(AggregatorRegistry::with_builtins()),
            ConvergenceCriterion::WorksetEmpty,
        );
        let barrier = tokio::spawn(barrier.run());

        handle.report(report(0, 1, 1)).await.unwrap();
        handle.report(report(2, 1, 1)).await.unwrap();

        let mut waiting = handle.clone();
        let mut decision = task::spawn(async move { waiting.decision(1).await });
        assert_pending!(decision.poll());
        tokio::task::yield_now().await;
        assert_pending!(decision.poll());
        assert_eq!(handle.latest(), None);

        handle.report(report(1, 1, 1)).await.unwrap();
        while handle.latest().is_none() {
            tokio::task::yield_now().await;
        }
        assert!(decision.is_woken());
        assert_eq!(assert_ready_ok!(decision.poll()), BarrierDecision::Continue);
        barrier.abort();
    }

    #[tokio::test]
    async fn test_convergence_wins_over_bound() {
        let (barrier, mut handle) = SyncBarrier::new(
            settings(1, 1, 1_000),
            Arc::new(AggregatorRegistry::with_builtins()),
            ConvergenceCriterion::WorksetEmpty,
        );
        let barrier = tokio::spawn(barrier.run());
        handle.report(report(0, 1, 0)).await.unwrap();
        assert_eq!(
            handle.decision(1).await.unwrap(),
            BarrierDecision::Terminate(TerminationCause::Converged)
        );
        assert_eq!(barrier.await.unwrap().unwrap().supersteps, 1);
    }

    #[tokio::test]
    async fn test_bound_exhaustion_terminates_normally() {
        let (barrier, mut handle) = SyncBarrier::new(
            settings(1, 2, 1_000),
            Arc::new(AggregatorRegistry::with_builtins()),
            ConvergenceCriterion::WorksetEmpty,
        );
        let barrier = tokio::spawn(barrier.run());
        handle.report(report(0, 1, 5)).await.unwrap();
        assert_eq!(handle.decision(1).await.unwrap(), BarrierDecision::Continue);
        handle.report(report(0, 2, 5)).await.unwrap();
        assert_eq!(
            handle.decision(2).await.unwrap(),
            BarrierDecision::Terminate(TerminationCause::MaxSuperstepsReached)
        );
        let outcome = barrier.await.unwrap().unwrap();
        assert_eq!(outcome.cause, TerminationCause::MaxSuperstepsReached);
    }

    #[tokio::test]
    async fn test_timeout_aborts_waiting_heads() {
        let (barrier, mut handle) = SyncBarrier::new(
            settings(2, 10, 50),
            Arc::new(AggregatorRegistry::with_builtins()),
            ConvergenceCriterion::WorksetEmpty,
        );
        let barrier = tokio::spawn(barrier.run());
        handle.report(report(0, 1, 1)).await.unwrap();

        assert_eq!(
            handle.decision(1).await.unwrap(),
            BarrierDecision::Terminate(TerminationCause::Aborted)
        );
        match barrier.await.unwrap() {
            Err(IterationError::BarrierTimeout {
                reported, expected, ..
            }) => {
                assert_eq!(reported, 1);
                assert_eq!(expected, 2);
            }
            other => panic!("expected barrier timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_reports_are_protocol_errors() {
        let (barrier, handle) = SyncBarrier::new(
            settings(2, 10, 1_000),
            Arc::new(AggregatorRegistry::with_builtins()),
            ConvergenceCriterion::WorksetEmpty,
        );
        let barrier = tokio::spawn(barrier.run());
        handle.report(report(0, 1, 1)).await.unwrap();
        handle.report(report(0, 1, 1)).await.unwrap();
        assert!(matches!(
            barrier.await.unwrap(),
            Err(IterationError::BarrierProtocol { superstep: 1, .. })
        ));

        let (barrier, handle) = SyncBarrier::new(
            settings(2, 10, 1_000),
            Arc::new(AggregatorRegistry::with_builtins()),
            ConvergenceCriterion::WorksetEmpty,
        );
        let barrier = tokio::spawn(barrier.run());
        handle.report(report(1, 2, 1)).await.unwrap();
        assert!(matches!(
            barrier.await.unwrap(),
            Err(IterationError::BarrierProtocol { .. })
        ));
    }
}
