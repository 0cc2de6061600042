//! Solution-set arena: one store slot per partition, indexed by partition id.
//!
//! A slot is shared only by the tasks of its own partition (the head that builds it and
//! the stages that probe or commit), so its mutex is never contended across partitions.
//! Superstep ordering between those tasks comes from the barrier, not from the lock.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{KeyedPartitionStore, StoreStats};
use crate::error::{IterationError, Result};
use crate::record::{Key, Record};

/// Shared access to one partition's solution set
#[derive(Debug, Clone)]
pub struct SolutionSetHandle {
    partition: usize,
    slot: Arc<Mutex<Option<KeyedPartitionStore>>>,
}

impl SolutionSetHandle {
    fn new(partition: usize) -> Self {
        Self {
            partition,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Install the store built by the partition's head
    pub fn install(&self, store: KeyedPartitionStore) {
        *self.slot.lock() = Some(store);
    }

    pub fn is_built(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Run `f` against the built store
    pub fn with_store<T>(&self, f: impl FnOnce(&mut KeyedPartitionStore) -> Result<T>) -> Result<T> {
        let mut guard = self.slot.lock();
        match guard.as_mut() {
            Some(store) => f(store),
            None => Err(IterationError::SolutionSetNotBuilt {
                partition: self.partition,
            }),
        }
    }

    pub fn probe(&self, key: Key) -> Result<Option<Record>> {
        self.with_store(|store| store.probe(key))
    }

    /// Commit a record, with or without the verification read
    pub fn commit(&self, record: Record, without_reprobe: bool) -> Result<()> {
        self.with_store(|store| {
            if without_reprobe {
                store.update_without_reprobe(record)
            } else {
                store.update(record)
            }
        })
    }

    pub fn keys(&self) -> Result<Vec<Key>> {
        self.with_store(|store| Ok(store.keys()))
    }

    pub fn entries(&self) -> Result<Vec<Record>> {
        self.with_store(|store| store.entries())
    }

    pub fn len(&self) -> Result<usize> {
        self.with_store(|store| Ok(store.len()))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.with_store(|store| Ok(store.stats()))
    }

    /// Drop the store, deleting its spill files
    pub fn release(&self) -> Option<KeyedPartitionStore> {
        self.slot.lock().take()
    }
}

/// All partition slots of one iterative scope
#[derive(Debug, Clone)]
pub struct SolutionSetArena {
    slots: Vec<SolutionSetHandle>,
}

impl SolutionSetArena {
    pub fn new(partitions: usize) -> Self {
        Self {
            slots: (0..partitions).map(SolutionSetHandle::new).collect(),
        }
    }

    pub fn partitions(&self) -> usize {
        self.slots.len()
    }

    pub fn handle(&self, partition: usize) -> SolutionSetHandle {
        self.slots[partition].clone()
    }

    /// Release every partition's store
    pub fn release_all(&self) {
        for slot in &self.slots {
            slot.release();
        }
    }

    /// Keys across all partitions, for key-set invariants in tests and diagnostics
    pub fn all_keys(&self) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        for slot in &self.slots {
            if slot.is_built() {
                keys.extend(slot.keys()?);
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }
}
