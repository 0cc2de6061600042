//! # Stage Edges
//!
//! Every edge inside a superstep is a set of bounded mpsc channels, one per consumer
//! partition. An [`OutputEmitter`] routes a producer partition's records by the edge's ship
//! strategy and batches them per target; an [`InputGate`] collects a consumer partition's
//! input for one superstep, which is complete once every upstream sender has signalled the
//! end of that superstep.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::mpsc;

use super::message::{Payload, StageMessage};
use crate::error::{IterationError, Result};
use crate::record::{Partitioner, Record};

/// Records buffered per target before a batch is sent
pub const EMIT_BATCH_RECORDS: usize = 256;

/// How records are routed from producer partitions to consumer partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipStrategy {
    /// Partition `p` feeds partition `p`
    Forward,
    /// Records go to the partition owning their key
    PartitionHash,
    /// Every record goes to every partition
    Broadcast,
}

/// Whether records cross the edge by value or serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    InProcess,
    Network,
}

/// Transport and ship strategy of one edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    pub transport: Transport,
    pub ship_strategy: ShipStrategy,
}

impl EdgeDescriptor {
    pub const fn new(transport: Transport, ship_strategy: ShipStrategy) -> Self {
        Self {
            transport,
            ship_strategy,
        }
    }

    pub const fn forward() -> Self {
        Self::new(Transport::InProcess, ShipStrategy::Forward)
    }

    pub const fn network_hash() -> Self {
        Self::new(Transport::Network, ShipStrategy::PartitionHash)
    }

    /// Number of end-of-superstep events a consumer partition waits for
    pub fn upstream_senders(&self, parallelism: usize) -> usize {
        match self.ship_strategy {
            ShipStrategy::Forward => 1,
            ShipStrategy::PartitionHash | ShipStrategy::Broadcast => parallelism,
        }
    }
}

impl fmt::Display for EdgeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.transport, self.ship_strategy)
    }
}

/// Default edges: the head ships to its first consumer over the network by key, stage to
/// stage edges stay local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDescriptors {
    pub head_output: EdgeDescriptor,
    pub stage_output: EdgeDescriptor,
}

impl Default for EdgeDescriptors {
    fn default() -> Self {
        Self {
            head_output: EdgeDescriptor::network_hash(),
            stage_output: EdgeDescriptor::forward(),
        }
    }
}

/// Producer side of an edge for one partition
#[derive(Debug)]
pub struct OutputEmitter {
    name: String,
    edge: EdgeDescriptor,
    partition: usize,
    partitioner: Partitioner,
    targets: Vec<mpsc::Sender<StageMessage>>,
    buffers: Vec<Vec<Record>>,
    emitted: usize,
}

impl OutputEmitter {
    /// `targets` holds one sender per consumer partition, indexed by partition
    pub fn new(
        name: impl Into<String>,
        edge: EdgeDescriptor,
        partition: usize,
        targets: Vec<mpsc::Sender<StageMessage>>,
    ) -> Self {
        let partitions = targets.len();
        Self {
            name: name.into(),
            edge,
            partition,
            partitioner: Partitioner::new(partitions),
            buffers: vec![Vec::new(); partitions],
            targets,
            emitted: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records emitted over the emitter's lifetime
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub async fn emit(&mut self, record: Record) -> Result<()> {
        self.emitted += 1;
        match self.edge.ship_strategy {
            ShipStrategy::Forward => self.buffer(self.partition, record).await,
            ShipStrategy::PartitionHash => {
                let target = self.partitioner.partition(record.key);
                self.buffer(target, record).await
            }
            ShipStrategy::Broadcast => {
                for target in 0..self.targets.len() {
                    self.buffer(target, record.clone()).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn emit_all(&mut self, records: impl IntoIterator<Item = Record>) -> Result<()> {
        for record in records {
            self.emit(record).await?;
        }
        Ok(())
    }

    /// Flush every buffer, then tell each target the superstep is complete
    pub async fn end_superstep(&mut self, superstep: u32) -> Result<()> {
        for target in self.target_indices() {
            self.flush(target).await?;
            self.send(
                target,
                StageMessage::EndOfSuperstep {
                    superstep,
                    sender: self.partition,
                },
            )
            .await?;
        }
        Ok(())
    }

    pub async fn terminate(&mut self) -> Result<()> {
        for target in self.target_indices() {
            self.flush(target).await?;
            self.send(
                target,
                StageMessage::Terminate {
                    sender: self.partition,
                },
            )
            .await?;
        }
        Ok(())
    }

    fn target_indices(&self) -> std::ops::Range<usize> {
        match self.edge.ship_strategy {
            ShipStrategy::Forward => self.partition..self.partition + 1,
            ShipStrategy::PartitionHash | ShipStrategy::Broadcast => 0..self.targets.len(),
        }
    }

    async fn buffer(&mut self, target: usize, record: Record) -> Result<()> {
        self.buffers[target].push(record);
        if self.buffers[target].len() >= EMIT_BATCH_RECORDS {
            self.flush(target).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, target: usize) -> Result<()> {
        if self.buffers[target].is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.buffers[target]);
        let payload = match self.edge.transport {
            Transport::InProcess => Payload::Local(records),
            Transport::Network => Payload::encode(records)?,
        };
        self.send(target, StageMessage::Batch(payload)).await
    }

    async fn send(&self, target: usize, message: StageMessage) -> Result<()> {
        self.targets[target].send(message).await.map_err(|_| {
            IterationError::channel_closed(format!("{} -> partition {target}", self.name))
        })
    }
}

/// Consumer side of an edge for one partition
#[derive(Debug)]
pub struct InputGate {
    name: String,
    receiver: mpsc::Receiver<StageMessage>,
    upstream_senders: usize,
}

impl InputGate {
    pub fn new(
        name: impl Into<String>,
        receiver: mpsc::Receiver<StageMessage>,
        upstream_senders: usize,
    ) -> Self {
        Self {
            name: name.into(),
            receiver,
            upstream_senders,
        }
    }

    /// Collect the input of `superstep`. `None` once every sender has terminated.
    pub async fn next_superstep(&mut self, superstep: u32) -> Result<Option<Vec<Record>>> {
        let mut records = Vec::new();
        let mut ended = BTreeSet::new();
        let mut terminated = BTreeSet::new();

        loop {
            let message = self
                .receiver
                .recv()
                .await
                .ok_or_else(|| IterationError::channel_closed(self.name.clone()))?;

            match message {
                StageMessage::Batch(payload) => records.extend(payload.into_records()?),
                StageMessage::EndOfSuperstep {
                    superstep: ended_superstep,
                    sender,
                } => {
                    if ended_superstep != superstep || !ended.insert(sender) {
                        return Err(self.protocol_error(
                            superstep,
                            format!("unexpected end of superstep {ended_superstep} from sender {sender}"),
                        ));
                    }
                    if ended.len() == self.upstream_senders {
                        return Ok(Some(records));
                    }
                }
                StageMessage::Terminate { sender } => {
                    if !records.is_empty() || !ended.is_empty() || !terminated.insert(sender) {
                        return Err(self.protocol_error(
                            superstep,
                            format!("unexpected terminate from sender {sender}"),
                        ));
                    }
                    if terminated.len() == self.upstream_senders {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn protocol_error(&self, superstep: u32, message: String) -> IterationError {
        IterationError::BarrierProtocol {
            superstep,
            message: format!("{}: {message}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(ship_strategy: ShipStrategy) -> EdgeDescriptor {
        EdgeDescriptor::new(Transport::Network, ship_strategy)
    }

    fn wire(partitions: usize) -> (Vec<mpsc::Sender<StageMessage>>, Vec<mpsc::Receiver<StageMessage>>) {
        (0..partitions).map(|_| mpsc::channel(64)).unzip()
    }

    #[tokio::test]
    async fn test_partition_hash_routes_by_key_and_gates_on_all_senders() {
        let (senders, receivers) = wire(2);
        let partitioner = Partitioner::new(2);
        let mut producers: Vec<_> = (0..2)
            .map(|p| OutputEmitter::new("head", edge(ShipStrategy::PartitionHash), p, senders.clone()))
            .collect();

        for (p, producer) in producers.iter_mut().enumerate() {
            for key in 0..10 {
                producer.emit(Record::pair(key, p as i64)).await.unwrap();
            }
            producer.end_superstep(1).await.unwrap();
        }

        for (partition, receiver) in receivers.into_iter().enumerate() {
            let mut gate = InputGate::new("reduce", receiver, 2);
            let records = gate.next_superstep(1).await.unwrap().unwrap();
            assert!(records.iter().all(|r| partitioner.partition(r.key) == partition));
            assert_eq!(
                records.len(),
                2 * (0..10).filter(|k| partitioner.partition(*k) == partition).count()
            );
        }
    }

    #[tokio::test]
    async fn test_forward_and_terminate() {
        let (senders, mut receivers) = wire(2);
        let mut producer = OutputEmitter::new("stage", EdgeDescriptor::forward(), 1, senders);
        producer.emit(Record::pair(8, 8)).await.unwrap();
        producer.end_superstep(1).await.unwrap();
        producer.terminate().await.unwrap();

        let mut gate = InputGate::new("tail", receivers.remove(1), 1);
        assert_eq!(gate.next_superstep(1).await.unwrap(), Some(vec![Record::pair(8, 8)]));
        assert_eq!(gate.next_superstep(2).await.unwrap(), None);
        assert!(receivers[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_partition() {
        let (senders, receivers) = wire(3);
        let mut producer = OutputEmitter::new("head", edge(ShipStrategy::Broadcast), 0, senders);
        producer.emit(Record::pair(1, 1)).await.unwrap();
        producer.end_superstep(1).await.unwrap();
        assert_eq!(producer.emitted(), 1);

        for receiver in receivers {
            let mut gate = InputGate::new("stage", receiver, 1);
            assert_eq!(gate.next_superstep(1).await.unwrap().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_network_edge_carries_non_finite_doubles() {
        let (senders, mut receivers) = wire(1);
        let mut producer = OutputEmitter::new("head", edge(ShipStrategy::Forward), 0, senders);
        let values = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY];
        for (key, value) in values.iter().enumerate() {
            producer
                .emit(Record::new(key as i64, vec![crate::record::Field::Double(*value)]))
                .await
                .unwrap();
        }
        producer.end_superstep(1).await.unwrap();

        let mut gate = InputGate::new("reduce", receivers.remove(0), 1);
        let records = gate.next_superstep(1).await.unwrap().unwrap();
        assert_eq!(records.len(), 3);
        for record in records {
            match record.field(0) {
                Some(crate::record::Field::Double(read)) => {
                    assert_eq!(read.to_bits(), values[record.key as usize].to_bits())
                }
                other => panic!("expected a double, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_stale_end_of_superstep_is_rejected() {
        let (sender, receiver) = mpsc::channel(4);
        sender
            .send(StageMessage::EndOfSuperstep {
                superstep: 3,
                sender: 0,
            })
            .await
            .unwrap();
        let mut gate = InputGate::new("stage", receiver, 1);
        assert!(matches!(
            gate.next_superstep(2).await,
            Err(IterationError::BarrierProtocol { superstep: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_senders_close_the_gate() {
        let (sender, receiver) = mpsc::channel::<StageMessage>(4);
        drop(sender);
        let mut gate = InputGate::new("stage", receiver, 1);
        let error = gate.next_superstep(1).await.unwrap_err();
        assert!(error.is_secondary());
    }
}
