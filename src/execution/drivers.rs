//! Stage drivers: how a stage turns one superstep's input into output records

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::functions::{
    Collector, FunctionContext, IdentityMap, MapFunction, ReduceFunction, SolutionSetJoinFunction,
};
use crate::error::{IterationError, Result};
use crate::record::{Key, Partitioner, Record};

/// Ordering applied to a stage's input before the driver runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStrategy {
    #[default]
    None,
    /// Stable sort by key
    Sort,
    /// Equal keys made adjacent, in order of first appearance
    HashGroup,
}

impl LocalStrategy {
    pub fn groups_keys(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn apply(&self, mut records: Vec<Record>) -> Vec<Record> {
        match self {
            Self::None => records,
            Self::Sort => {
                records.sort_by_key(|record| record.key);
                records
            }
            Self::HashGroup => {
                let mut order = Vec::new();
                let mut groups: HashMap<Key, Vec<Record>> = HashMap::new();
                for record in records {
                    groups
                        .entry(record.key)
                        .or_insert_with(|| {
                            order.push(record.key);
                            Vec::new()
                        })
                        .push(record);
                }
                order
                    .into_iter()
                    .flat_map(|key| groups.remove(&key).unwrap_or_default())
                    .collect()
            }
        }
    }
}

/// Which keys may arrive at a stage of a given partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRouting {
    /// Records were routed to the partition owning their key
    Owned(Partitioner),
    /// Every partition receives every record and keeps the keys it owns
    Replicated(Partitioner),
}

impl KeyRouting {
    /// Whether this partition handles `key`; a foreign key on an owned route is an error
    fn admits(&self, key: Key, context: &FunctionContext) -> Result<bool> {
        match self {
            Self::Owned(partitioner) => {
                let owner = partitioner.partition(key);
                if owner == context.partition() {
                    Ok(true)
                } else {
                    Err(IterationError::MisroutedRecord {
                        stage: context.stage().to_string(),
                        key,
                        partition: context.partition(),
                        owner,
                        superstep: context.superstep(),
                    })
                }
            }
            Self::Replicated(partitioner) => Ok(partitioner.partition(key) == context.partition()),
        }
    }
}

/// The driver of a stage together with its user function
#[derive(Clone)]
pub enum Driver {
    Map(Arc<dyn MapFunction>),
    Reduce(Arc<dyn ReduceFunction>),
    SolutionSetJoin(Arc<dyn SolutionSetJoinFunction>),
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Driver::{}", self.kind())
    }
}

impl Driver {
    pub fn identity() -> Self {
        Self::Map(Arc::new(IdentityMap))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Map(_) => "map",
            Self::Reduce(_) => "reduce",
            Self::SolutionSetJoin(_) => "solution_set_join",
        }
    }

    /// Run the driver over one superstep's (locally ordered) input
    pub fn run(
        &self,
        records: Vec<Record>,
        context: &FunctionContext,
        routing: KeyRouting,
    ) -> Result<Vec<Record>> {
        let mut out = Collector::new();
        match self {
            Self::Map(function) => {
                for record in records {
                    let key = record.key;
                    function
                        .map(record, context, &mut out)
                        .map_err(|error| user_error(context, Some(key), &error))?;
                }
            }
            Self::Reduce(function) => {
                let mut records = records.into_iter().peekable();
                while let Some(first) = records.next() {
                    let key = first.key;
                    let mut group = vec![first];
                    while let Some(next) = records.next_if(|record| record.key == key) {
                        group.push(next);
                    }
                    function
                        .reduce(key, group, context, &mut out)
                        .map_err(|error| user_error(context, Some(key), &error))?;
                }
            }
            Self::SolutionSetJoin(function) => {
                for candidate in &records {
                    if !routing.admits(candidate.key, context)? {
                        continue;
                    }
                    let Some(current) = context.store().probe(candidate.key)? else {
                        continue;
                    };
                    function
                        .join(candidate, &current, context, &mut out)
                        .map_err(|error| user_error(context, Some(candidate.key), &error))?;
                }
            }
        }
        Ok(out.into_records())
    }
}

fn user_error(context: &FunctionContext, key: Option<Key>, error: &anyhow::Error) -> IterationError {
    IterationError::user_function(context.stage(), key, context.superstep(), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregatorRegistry, AggregatorSet};
    use crate::execution::functions::{reduce_fn, solution_set_join_fn};
    use crate::store::{KeyedPartitionStore, RetryPolicy, SolutionSetArena, StoreSettings};

    fn single() -> KeyRouting {
        KeyRouting::Owned(Partitioner::new(1))
    }

    fn context(initial: Vec<Record>) -> FunctionContext {
        let arena = SolutionSetArena::new(1);
        let settings = StoreSettings {
            memory_budget_bytes: 1 << 20,
            max_record_bytes: 1024,
            buckets: 4,
            spill_directory: std::env::temp_dir(),
            retry: RetryPolicy::default(),
        };
        arena
            .handle(0)
            .install(KeyedPartitionStore::build(0, settings, initial).unwrap());
        FunctionContext::new(
            Arc::from("driver-test"),
            0,
            4,
            arena.handle(0),
            AggregatorSet::new(Arc::new(AggregatorRegistry::with_builtins())),
        )
    }

    #[test]
    fn test_local_strategies() {
        let records = vec![Record::pair(3, 0), Record::pair(1, 1), Record::pair(3, 2)];
        let sorted = LocalStrategy::Sort.apply(records.clone());
        assert_eq!(sorted.iter().map(|r| r.key).collect::<Vec<_>>(), vec![1, 3, 3]);

        let grouped = LocalStrategy::HashGroup.apply(records.clone());
        assert_eq!(
            grouped,
            vec![Record::pair(3, 0), Record::pair(3, 2), Record::pair(1, 1)]
        );
        assert_eq!(LocalStrategy::None.apply(records.clone()), records);
    }

    #[test]
    fn test_reduce_sees_each_key_group_once() {
        let min = Driver::Reduce(reduce_fn(|key, group, _, out| {
            let min = group.iter().filter_map(|r| r.long(0)).min().unwrap_or(key);
            out.collect(Record::pair(key, min));
            Ok(())
        }));
        let input = LocalStrategy::Sort.apply(vec![
            Record::pair(2, 9),
            Record::pair(1, 5),
            Record::pair(2, 4),
        ]);
        let output = min.run(input, &context(vec![]), single()).unwrap();
        assert_eq!(output, vec![Record::pair(1, 5), Record::pair(2, 4)]);
    }

    #[test]
    fn test_solution_set_join_skips_unknown_keys() {
        let keep_smaller = Driver::SolutionSetJoin(solution_set_join_fn(|candidate, current, _, out| {
            if candidate.long(0) < current.long(0) {
                out.collect(candidate.clone());
            }
            Ok(())
        }));
        let context = context(vec![Record::pair(1, 10), Record::pair(2, 1)]);
        let output = keep_smaller
            .run(
                vec![Record::pair(1, 3), Record::pair(2, 3), Record::pair(99, 0)],
                &context,
                single(),
            )
            .unwrap();
        assert_eq!(output, vec![Record::pair(1, 3)]);
    }

    #[test]
    fn test_solution_set_join_checks_key_ownership() {
        let partitioner = Partitioner::new(2);
        let owned: Vec<Key> = (0..).filter(|k| partitioner.partition(*k) == 0).take(3).collect();
        let foreign = (0..).find(|k| partitioner.partition(*k) == 1).unwrap();
        let join = Driver::SolutionSetJoin(solution_set_join_fn(|candidate, _, _, out| {
            out.collect(candidate.clone());
            Ok(())
        }));
        let context = context(owned.iter().map(|k| Record::pair(*k, 0)).collect());
        let mut input: Vec<Record> = owned.iter().map(|k| Record::pair(*k, 1)).collect();
        input.push(Record::pair(foreign, 1));

        let replicated = join
            .run(input.clone(), &context, KeyRouting::Replicated(partitioner))
            .unwrap();
        assert_eq!(replicated.len(), owned.len());
        assert!(replicated.iter().all(|r| r.key != foreign));

        match join.run(input, &context, KeyRouting::Owned(partitioner)) {
            Err(IterationError::MisroutedRecord {
                key,
                partition,
                owner,
                ..
            }) => {
                assert_eq!(key, foreign);
                assert_eq!(partition, 0);
                assert_eq!(owner, 1);
            }
            other => panic!("expected misrouted record, got {other:?}"),
        }
    }

    #[test]
    fn test_user_failure_carries_stage_key_and_superstep() {
        let failing = Driver::Map(crate::execution::functions::map_fn(|_, _, _| {
            anyhow::bail!("bad record")
        }));
        match failing.run(vec![Record::pair(7, 0)], &context(vec![]), single()) {
            Err(IterationError::UserFunction {
                stage,
                key,
                superstep,
                message,
            }) => {
                assert_eq!(stage, "driver-test");
                assert_eq!(key, Some(7));
                assert_eq!(superstep, 4);
                assert!(message.contains("bad record"));
            }
            other => panic!("expected user function error, got {other:?}"),
        }
    }
}
