//! # User Functions
//!
//! The record-processing hooks a program plugs into the iteration roles. Each is a pure
//! function of its input records; the only engine state reachable from one is what the
//! [`FunctionContext`] exposes: read-only solution-set probes and aggregator contributions.
//!
//! Every trait is implemented for matching closures, and the `*_fn` constructors give
//! closures their signature without annotations.

use std::sync::Arc;

use crate::aggregation::{AggregateValue, AggregatorSet};
use crate::error::Result;
use crate::record::{Key, Record};
use crate::store::SolutionSetHandle;

/// What a user function may see of the engine
#[derive(Debug, Clone)]
pub struct FunctionContext {
    stage: Arc<str>,
    partition: usize,
    superstep: u32,
    store: SolutionSetHandle,
    aggregators: AggregatorSet,
}

impl FunctionContext {
    pub fn new(
        stage: Arc<str>,
        partition: usize,
        superstep: u32,
        store: SolutionSetHandle,
        aggregators: AggregatorSet,
    ) -> Self {
        Self {
            stage,
            partition,
            superstep,
            store,
            aggregators,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn superstep(&self) -> u32 {
        self.superstep
    }

    /// Read the current solution-set record for a key of this partition
    pub fn probe(&self, key: Key) -> Result<Option<Record>> {
        self.store.probe(key)
    }

    /// Contribute to a registered aggregator for this superstep
    pub fn aggregate(&self, name: &str, value: AggregateValue) -> Result<()> {
        self.aggregators.add(name, value)
    }

    pub(crate) fn store(&self) -> &SolutionSetHandle {
        &self.store
    }
}

/// Output buffer handed to user functions
#[derive(Debug, Default)]
pub struct Collector {
    records: Vec<Record>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Head join of a workset record with one invariant record of the same key
pub trait MatchFunction: Send + Sync {
    fn join(
        &self,
        workset: &Record,
        invariant: &Record,
        context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()>;
}

impl<F> MatchFunction for F
where
    F: Fn(&Record, &Record, &FunctionContext, &mut Collector) -> anyhow::Result<()> + Send + Sync,
{
    fn join(
        &self,
        workset: &Record,
        invariant: &Record,
        context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()> {
        self(workset, invariant, context, out)
    }
}

/// Row-wise transform
pub trait MapFunction: Send + Sync {
    fn map(&self, record: Record, context: &FunctionContext, out: &mut Collector)
        -> anyhow::Result<()>;
}

impl<F> MapFunction for F
where
    F: Fn(Record, &FunctionContext, &mut Collector) -> anyhow::Result<()> + Send + Sync,
{
    fn map(
        &self,
        record: Record,
        context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()> {
        self(record, context, out)
    }
}

/// Reduction over all records of one key
pub trait ReduceFunction: Send + Sync {
    fn reduce(
        &self,
        key: Key,
        group: Vec<Record>,
        context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()>;
}

impl<F> ReduceFunction for F
where
    F: Fn(Key, Vec<Record>, &FunctionContext, &mut Collector) -> anyhow::Result<()> + Send + Sync,
{
    fn reduce(
        &self,
        key: Key,
        group: Vec<Record>,
        context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()> {
        self(key, group, context, out)
    }
}

/// Join of a candidate with the current solution-set record of its key
pub trait SolutionSetJoinFunction: Send + Sync {
    fn join(
        &self,
        candidate: &Record,
        current: &Record,
        context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()>;
}

impl<F> SolutionSetJoinFunction for F
where
    F: Fn(&Record, &Record, &FunctionContext, &mut Collector) -> anyhow::Result<()> + Send + Sync,
{
    fn join(
        &self,
        candidate: &Record,
        current: &Record,
        context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()> {
        self(candidate, current, context, out)
    }
}

/// Pass-through map used by the split tails
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMap;

impl MapFunction for IdentityMap {
    fn map(&self, record: Record, _: &FunctionContext, out: &mut Collector) -> anyhow::Result<()> {
        out.collect(record);
        Ok(())
    }
}

pub fn match_fn<F>(f: F) -> Arc<dyn MatchFunction>
where
    F: Fn(&Record, &Record, &FunctionContext, &mut Collector) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

pub fn map_fn<F>(f: F) -> Arc<dyn MapFunction>
where
    F: Fn(Record, &FunctionContext, &mut Collector) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn reduce_fn<F>(f: F) -> Arc<dyn ReduceFunction>
where
    F: Fn(Key, Vec<Record>, &FunctionContext, &mut Collector) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

pub fn solution_set_join_fn<F>(f: F) -> Arc<dyn SolutionSetJoinFunction>
where
    F: Fn(&Record, &Record, &FunctionContext, &mut Collector) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregatorRegistry;
    use crate::store::SolutionSetArena;

    fn context() -> FunctionContext {
        FunctionContext::new(
            Arc::from("test"),
            0,
            1,
            SolutionSetArena::new(1).handle(0),
            AggregatorSet::new(Arc::new(AggregatorRegistry::with_builtins())),
        )
    }

    #[test]
    fn test_closures_implement_function_traits() {
        let double = map_fn(|record, _, out| {
            let value = record.long(0).unwrap_or_default();
            out.collect(Record::pair(record.key, value * 2));
            Ok(())
        });
        let mut out = Collector::new();
        double.map(Record::pair(1, 21), &context(), &mut out).unwrap();
        assert_eq!(out.into_records(), vec![Record::pair(1, 42)]);

        let count = reduce_fn(|key, group, _, out| {
            out.collect(Record::pair(key, group.len() as i64));
            Ok(())
        });
        let mut out = Collector::new();
        count
            .reduce(3, vec![Record::pair(3, 1), Record::pair(3, 2)], &context(), &mut out)
            .unwrap();
        assert_eq!(out.into_records(), vec![Record::pair(3, 2)]);
    }

    #[test]
    fn test_aggregate_reaches_the_partition_set() {
        let aggregators = AggregatorSet::new(Arc::new(AggregatorRegistry::with_builtins()));
        let context = FunctionContext::new(
            Arc::from("test"),
            0,
            1,
            SolutionSetArena::new(1).handle(0),
            aggregators.clone(),
        );
        context
            .aggregate(
                crate::constants::aggregators::WORKSET_SIZE,
                AggregateValue::Long(3),
            )
            .unwrap();
        assert!(context.aggregate("unregistered", AggregateValue::Long(1)).is_err());

        let snapshot = aggregators.snapshot_and_reset();
        assert_eq!(
            snapshot[crate::constants::aggregators::WORKSET_SIZE],
            AggregateValue::Long(3)
        );
    }

    #[test]
    fn test_context_probe_before_build_fails() {
        assert!(context().probe(1).is_err());
        assert_eq!(context().stage(), "test");
    }
}
