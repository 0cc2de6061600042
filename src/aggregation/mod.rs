//! # Aggregators and Convergence
//!
//! Named per-partition accumulators, reset every superstep and merged across partitions at
//! the barrier. Each name is registered with an explicit merge function; merging a superstep
//! is a plain fold over the partition snapshots in partition order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::constants::aggregators::{SOLUTION_SET_UPDATES, WORKSET_SIZE};
use crate::error::{IterationError, Result};

/// Value held by an aggregator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AggregateValue {
    Long(i64),
    Double(f64),
}

impl AggregateValue {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(value) => Some(*value),
            Self::Double(_) => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Long(value) => Some(*value as f64),
            Self::Double(value) => Some(*value),
        }
    }

    fn same_kind(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Long(_), Self::Long(_)) | (Self::Double(_), Self::Double(_))
        )
    }
}

impl fmt::Display for AggregateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value}"),
        }
    }
}

/// Merged or per-partition aggregator values by name
pub type Aggregates = BTreeMap<String, AggregateValue>;

/// Associative, commutative combine function
pub type MergeFn = fn(AggregateValue, AggregateValue) -> AggregateValue;

/// Built-in merge functions
pub mod merge {
    use super::AggregateValue;

    pub fn long_sum(a: AggregateValue, b: AggregateValue) -> AggregateValue {
        match (a, b) {
            (AggregateValue::Long(a), AggregateValue::Long(b)) => {
                AggregateValue::Long(a.saturating_add(b))
            }
            (a, b) => double_sum(a, b),
        }
    }

    pub fn long_min(a: AggregateValue, b: AggregateValue) -> AggregateValue {
        match (a, b) {
            (AggregateValue::Long(a), AggregateValue::Long(b)) => AggregateValue::Long(a.min(b)),
            (a, _) => a,
        }
    }

    pub fn long_max(a: AggregateValue, b: AggregateValue) -> AggregateValue {
        match (a, b) {
            (AggregateValue::Long(a), AggregateValue::Long(b)) => AggregateValue::Long(a.max(b)),
            (a, _) => a,
        }
    }

    pub fn double_sum(a: AggregateValue, b: AggregateValue) -> AggregateValue {
        let a = a.as_double().unwrap_or_default();
        let b = b.as_double().unwrap_or_default();
        AggregateValue::Double(a + b)
    }
}

#[derive(Debug, Clone)]
struct Registration {
    initial: AggregateValue,
    merge: MergeFn,
}

/// Aggregator names with their identity values and merge functions
#[derive(Debug, Clone)]
pub struct AggregatorRegistry {
    registrations: BTreeMap<String, Registration>,
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl AggregatorRegistry {
    /// Registry holding the workset-size and solution-set-update counters
    pub fn with_builtins() -> Self {
        Self {
            registrations: BTreeMap::new(),
        }
        .register(WORKSET_SIZE, AggregateValue::Long(0), merge::long_sum)
        .register(SOLUTION_SET_UPDATES, AggregateValue::Long(0), merge::long_sum)
    }

    pub fn register(mut self, name: impl Into<String>, initial: AggregateValue, merge: MergeFn) -> Self {
        self.registrations
            .insert(name.into(), Registration { initial, merge });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registrations.keys().map(String::as_str)
    }

    /// Identity values for every registered aggregator
    pub fn initial_values(&self) -> Aggregates {
        self.registrations
            .iter()
            .map(|(name, registration)| (name.clone(), registration.initial))
            .collect()
    }

    /// Fold per-partition snapshots into one scope-wide value per name
    pub fn merge_all<'a>(&self, snapshots: impl IntoIterator<Item = &'a Aggregates>) -> Result<Aggregates> {
        let mut merged = self.initial_values();
        for snapshot in snapshots {
            for (name, value) in snapshot {
                let registration = self.registration(name)?;
                let current = merged.entry(name.clone()).or_insert(registration.initial);
                *current = (registration.merge)(*current, *value);
            }
        }
        Ok(merged)
    }

    fn registration(&self, name: &str) -> Result<&Registration> {
        self.registrations
            .get(name)
            .ok_or_else(|| IterationError::Aggregator {
                name: name.to_string(),
                message: "not registered".to_string(),
            })
    }
}

/// One partition's accumulators for the current superstep
///
/// Cloned into every task of the partition; all clones share the same values.
#[derive(Debug, Clone)]
pub struct AggregatorSet {
    registry: Arc<AggregatorRegistry>,
    values: Arc<Mutex<Aggregates>>,
}

impl AggregatorSet {
    pub fn new(registry: Arc<AggregatorRegistry>) -> Self {
        let values = registry.initial_values();
        Self {
            registry,
            values: Arc::new(Mutex::new(values)),
        }
    }

    /// Merge `value` into the named accumulator
    pub fn add(&self, name: &str, value: AggregateValue) -> Result<()> {
        let registration = self.registry.registration(name)?;
        if !registration.initial.same_kind(&value) {
            return Err(IterationError::Aggregator {
                name: name.to_string(),
                message: format!("expected {:?}-typed contribution, got {value:?}", registration.initial),
            });
        }
        let mut values = self.values.lock();
        let current = values.entry(name.to_string()).or_insert(registration.initial);
        *current = (registration.merge)(*current, value);
        Ok(())
    }

    pub fn add_long(&self, name: &str, value: i64) -> Result<()> {
        self.add(name, AggregateValue::Long(value))
    }

    pub fn get(&self, name: &str) -> Option<AggregateValue> {
        self.values.lock().get(name).copied()
    }

    /// Take this superstep's values and reset every accumulator to its identity
    pub fn snapshot_and_reset(&self) -> Aggregates {
        let mut values = self.values.lock();
        std::mem::replace(&mut *values, self.registry.initial_values())
    }
}

type Predicate = Arc<dyn Fn(&Aggregates) -> bool + Send + Sync>;

/// Predicate deciding convergence from the merged aggregates of a superstep
#[derive(Clone)]
pub enum ConvergenceCriterion {
    /// The summed workset size is zero
    WorksetEmpty,
    /// User predicate over the merged aggregates
    Custom { name: String, predicate: Predicate },
}

impl Default for ConvergenceCriterion {
    fn default() -> Self {
        Self::WorksetEmpty
    }
}

impl fmt::Debug for ConvergenceCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorksetEmpty => write!(f, "WorksetEmpty"),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

impl ConvergenceCriterion {
    pub fn custom(
        name: impl Into<String>,
        predicate: impl Fn(&Aggregates) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn is_converged(&self, aggregates: &Aggregates) -> bool {
        match self {
            Self::WorksetEmpty => aggregates
                .get(WORKSET_SIZE)
                .and_then(AggregateValue::as_long)
                == Some(0),
            Self::Custom { predicate, .. } => predicate(aggregates),
        }
    }
}
