//! Commit acknowledgement between a partition's committing stage and its head

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::error::{IterationError, Result};

/// Counts commit acknowledgements per superstep for one partition
///
/// A superstep is complete once every committing stage of the partition has acknowledged
/// it. Heads running in wait-for-update mode block on [`SolutionSetUpdateLatch::wait`]
/// before reporting to the barrier.
#[derive(Debug)]
pub struct SolutionSetUpdateLatch {
    partition: usize,
    committers: usize,
    pending: Mutex<BTreeMap<u32, usize>>,
    completed: watch::Sender<u32>,
}

impl SolutionSetUpdateLatch {
    pub fn new(partition: usize, committers: usize) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            partition,
            committers: committers.max(1),
            pending: Mutex::new(BTreeMap::new()),
            completed,
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Latest superstep whose commit every committer acknowledged
    pub fn completed(&self) -> u32 {
        *self.completed.borrow()
    }

    pub fn acknowledge(&self, superstep: u32) {
        let mut pending = self.pending.lock();
        let count = pending.entry(superstep).or_insert(0);
        *count += 1;
        if *count >= self.committers {
            pending.remove(&superstep);
            self.completed
                .send_if_modified(|completed| {
                    if superstep > *completed {
                        *completed = superstep;
                        true
                    } else {
                        false
                    }
                });
        }
    }

    pub async fn wait(&self, superstep: u32) -> Result<()> {
        let mut completed = self.completed.subscribe();
        completed
            .wait_for(|completed| *completed >= superstep)
            .await
            .map(|_| ())
            .map_err(|_| IterationError::channel_closed("solution set update latch"))
    }
}
