use proptest::prelude::*;

use iterflow_core::Record;

/// Strategy for keys in a small range so that collisions are frequent
pub fn key_strategy() -> impl Strategy<Value = i64> {
    -500i64..500
}

/// Strategy for single-field records
pub fn pair_strategy() -> impl Strategy<Value = Record> {
    (key_strategy(), any::<i64>()).prop_map(|(key, value)| Record::pair(key, value))
}

/// Strategy for initial solution sets; duplicate keys are allowed
pub fn solution_set_strategy() -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec(pair_strategy(), 1..300)
}

/// Strategy for update sequences given as (index into the key set, new value)
pub fn update_sequence_strategy() -> impl Strategy<Value = Vec<(usize, i64)>> {
    prop::collection::vec((any::<usize>(), any::<i64>()), 0..200)
}

/// Strategy for memory budgets ranging from heavy spilling to fully resident
pub fn memory_budget_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(256usize), Just(1024), Just(4096), Just(1024 * 1024)]
}

/// Strategy for long aggregate contributions of a few partitions
pub fn contributions_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(-1_000_000i64..1_000_000, 1..16)
}
