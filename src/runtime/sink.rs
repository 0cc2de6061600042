//! Final output of an iterative scope

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::record::Record;

pub const FINAL_SINK_STAGE: &str = "Final Sink";

/// Final solution set of every partition of a terminated scope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalOutput {
    partitions: Vec<Vec<Record>>,
}

impl FinalOutput {
    /// `partitions[p]` holds the records of partition `p`
    pub fn new(partitions: Vec<Vec<Record>>) -> Self {
        Self { partitions }
    }

    pub fn partitions(&self) -> &[Vec<Record>] {
        &self.partitions
    }

    pub fn partition(&self, partition: usize) -> Option<&[Record]> {
        self.partitions.get(partition).map(Vec::as_slice)
    }

    /// Records across all partitions
    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_partitions(self) -> Vec<Vec<Record>> {
        self.partitions
    }
}

/// Receiver of a scope's final solution set
///
/// Called exactly once per scope, after every task finished and the barrier decided a
/// normal termination. An aborted scope never reaches its sink.
#[async_trait]
pub trait FinalSink: Send + Sync {
    async fn deliver(&self, output: FinalOutput) -> anyhow::Result<()>;
}

/// Sink that keeps the delivered output in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    output: Mutex<Option<FinalOutput>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partitions delivered so far
    pub fn deliveries(&self) -> usize {
        self.output
            .lock()
            .as_ref()
            .map_or(0, |output| output.partitions().len())
    }

    /// All delivered records ordered by key
    pub fn records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .output
            .lock()
            .iter()
            .flat_map(|output| output.partitions().iter().flatten().cloned())
            .collect();
        records.sort_by_key(|record| record.key);
        records
    }

    pub fn partition(&self, partition: usize) -> Option<Vec<Record>> {
        self.output
            .lock()
            .as_ref()
            .and_then(|output| output.partition(partition).map(<[Record]>::to_vec))
    }
}

#[async_trait]
impl FinalSink for CollectingSink {
    async fn deliver(&self, output: FinalOutput) -> anyhow::Result<()> {
        let mut slot = self.output.lock();
        if slot.is_some() {
            anyhow::bail!("final output delivered twice");
        }
        *slot = Some(output);
        Ok(())
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingSink;

#[async_trait]
impl FinalSink for DiscardingSink {
    async fn deliver(&self, _output: FinalOutput) -> anyhow::Result<()> {
        Ok(())
    }
}
