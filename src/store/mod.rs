//! # Keyed Partition Store
//!
//! Solution-set storage for one partition: a hash table from key to the key's current
//! record. The table is split into a fixed number of hash buckets. When the resident size
//! exceeds the memory budget, the largest resident bucket is moved to a spill file.
//! A spilled bucket is an append-only log with an in-memory key → offset index: updates
//! append, probes seek. Callers never see the difference between resident and spilled
//! buckets.
//!
//! ## Key set
//!
//! Keys are created only by [`KeyedPartitionStore::build`]. Afterwards the key set is
//! fixed: updates overwrite existing keys and updating an unknown key is an error.

pub mod arena;
pub mod spill;

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::IterationConfig;
use crate::constants::events;
use crate::error::{IterationError, Result};
use crate::logging::log_store_operation;
use crate::record::{mix64, Key, Record};

pub use arena::{SolutionSetArena, SolutionSetHandle};
pub use spill::{RetryPolicy, SpillFile};

/// Spilled buckets are compacted once dead bytes exceed live bytes and this floor
const COMPACTION_FLOOR_BYTES: u64 = 64 * 1024;

/// Sizing and spill settings for one partition store
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub memory_budget_bytes: usize,
    pub max_record_bytes: usize,
    pub buckets: usize,
    pub spill_directory: PathBuf,
    pub retry: RetryPolicy,
}

impl StoreSettings {
    pub fn from_config(config: &IterationConfig) -> Self {
        Self {
            memory_budget_bytes: config.memory.solution_set_memory_bytes,
            max_record_bytes: config.memory.max_record_bytes,
            buckets: config.memory.store_buckets.max(1),
            spill_directory: config.spill_directory(),
            retry: RetryPolicy {
                retries: config.spill.io_retries,
                backoff: std::time::Duration::from_millis(config.spill.retry_backoff_ms),
            },
        }
    }
}

#[derive(Debug)]
struct ResidentBucket {
    entries: HashMap<Key, Record>,
    bytes: usize,
}

#[derive(Debug)]
struct SpilledBucket {
    file: SpillFile,
    index: HashMap<Key, (u64, u64)>,
    live_bytes: u64,
    dead_bytes: u64,
}

#[derive(Debug)]
enum Bucket {
    Resident(ResidentBucket),
    Spilled(SpilledBucket),
}

/// Counters for observability and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub probes: u64,
    pub updates: u64,
    pub reprobes: u64,
    pub spills: u64,
    pub compactions: u64,
}

/// Per-partition solution-set hash table with transparent spilling
#[derive(Debug)]
pub struct KeyedPartitionStore {
    partition: usize,
    settings: StoreSettings,
    buckets: Vec<Bucket>,
    resident_bytes: usize,
    len: usize,
    stats: StoreStats,
}

impl KeyedPartitionStore {
    /// Build the store from the partition's initial solution-set records.
    ///
    /// The input is consumed once. A key seen more than once keeps its last record.
    pub fn build(
        partition: usize,
        settings: StoreSettings,
        initial: impl IntoIterator<Item = Record>,
    ) -> Result<Self> {
        let buckets = (0..settings.buckets.max(1))
            .map(|_| {
                Bucket::Resident(ResidentBucket {
                    entries: HashMap::new(),
                    bytes: 0,
                })
            })
            .collect();
        let mut store = Self {
            partition,
            settings,
            buckets,
            resident_bytes: 0,
            len: 0,
            stats: StoreStats::default(),
        };

        for record in initial {
            store.check_capacity(&record)?;
            store.write(record, true)?;
        }

        log_store_operation(
            events::STORE_BUILT,
            partition,
            store.len,
            store.resident_bytes,
            store.spilled_bucket_count(),
            None,
        );
        Ok(store)
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    pub fn spilled_bucket_count(&self) -> usize {
        self.buckets
            .iter()
            .filter(|b| matches!(b, Bucket::Spilled(_)))
            .count()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn contains_key(&self, key: Key) -> bool {
        match &self.buckets[self.bucket_of(key)] {
            Bucket::Resident(bucket) => bucket.entries.contains_key(&key),
            Bucket::Spilled(bucket) => bucket.index.contains_key(&key),
        }
    }

    /// Current record for `key`
    pub fn probe(&mut self, key: Key) -> Result<Option<Record>> {
        self.stats.probes += 1;
        self.read(key)
    }

    /// Overwrite `record.key` and read the value back to verify the commit
    pub fn update(&mut self, record: Record) -> Result<()> {
        let key = record.key;
        let expected = record.clone();
        self.update_without_reprobe(record)?;

        self.stats.reprobes += 1;
        match self.read(key)? {
            Some(actual) if actual == expected => Ok(()),
            _ => Err(IterationError::ReprobeMismatch {
                partition: self.partition,
                key,
            }),
        }
    }

    /// Overwrite `record.key` without the verification read
    pub fn update_without_reprobe(&mut self, record: Record) -> Result<()> {
        if !self.contains_key(record.key) {
            return Err(IterationError::UnknownSolutionSetKey {
                partition: self.partition,
                key: record.key,
            });
        }
        self.check_capacity(&record)?;
        self.stats.updates += 1;
        self.write(record, false)
    }

    /// Every key currently in the store, resident and spilled
    pub fn keys(&self) -> Vec<Key> {
        let mut keys = Vec::with_capacity(self.len);
        for bucket in &self.buckets {
            match bucket {
                Bucket::Resident(b) => keys.extend(b.entries.keys().copied()),
                Bucket::Spilled(b) => keys.extend(b.index.keys().copied()),
            }
        }
        keys
    }

    /// Every current record, resident and spilled, in no particular order
    pub fn entries(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(self.len);
        for bucket in &mut self.buckets {
            match bucket {
                Bucket::Resident(b) => records.extend(b.entries.values().cloned()),
                Bucket::Spilled(b) => {
                    let mut offsets: Vec<u64> = b.index.values().map(|(offset, _)| *offset).collect();
                    offsets.sort_unstable();
                    for offset in offsets {
                        records.push(b.file.read_at(offset)?);
                    }
                }
            }
        }
        Ok(records)
    }

    fn bucket_of(&self, key: Key) -> usize {
        // Upper bits: the partitioner already consumed the low bits modulo P.
        ((mix64(key as u64) >> 32) % self.buckets.len() as u64) as usize
    }

    fn check_capacity(&self, record: &Record) -> Result<()> {
        let size = record.estimated_size();
        let limit = self
            .settings
            .max_record_bytes
            .min(self.settings.memory_budget_bytes);
        if size > limit {
            return Err(IterationError::StoreCapacityExceeded {
                partition: self.partition,
                key: record.key,
                size_bytes: size,
                limit_bytes: limit,
            });
        }
        Ok(())
    }

    fn read(&mut self, key: Key) -> Result<Option<Record>> {
        let index = self.bucket_of(key);
        match &mut self.buckets[index] {
            Bucket::Resident(bucket) => Ok(bucket.entries.get(&key).cloned()),
            Bucket::Spilled(bucket) => match bucket.index.get(&key) {
                Some((offset, _)) => Ok(Some(bucket.file.read_at(*offset)?)),
                None => Ok(None),
            },
        }
    }

    fn write(&mut self, record: Record, creating: bool) -> Result<()> {
        let index = self.bucket_of(record.key);
        let needs_compaction = match &mut self.buckets[index] {
            Bucket::Resident(bucket) => {
                let size = record.estimated_size();
                match bucket.entries.insert(record.key, record) {
                    Some(previous) => {
                        let previous_size = previous.estimated_size();
                        bucket.bytes = bucket.bytes + size - previous_size;
                        self.resident_bytes = self.resident_bytes + size - previous_size;
                    }
                    None => {
                        bucket.bytes += size;
                        self.resident_bytes += size;
                        self.len += 1;
                    }
                }
                false
            }
            Bucket::Spilled(bucket) => {
                let key = record.key;
                let (offset, frame) = bucket.file.append(&record)?;
                match bucket.index.insert(key, (offset, frame)) {
                    Some((_, previous_frame)) => {
                        bucket.dead_bytes += previous_frame;
                        bucket.live_bytes = bucket.live_bytes + frame - previous_frame;
                    }
                    None => {
                        debug_assert!(creating, "post-build inserts are rejected earlier");
                        bucket.live_bytes += frame;
                        self.len += 1;
                    }
                }
                bucket.dead_bytes > bucket.live_bytes && bucket.dead_bytes > COMPACTION_FLOOR_BYTES
            }
        };

        if needs_compaction {
            self.compact(index)?;
        }
        while self.resident_bytes > self.settings.memory_budget_bytes {
            if !self.spill_largest_bucket()? {
                break;
            }
        }
        Ok(())
    }

    /// Move the largest resident bucket to disk. Returns false when nothing is resident.
    fn spill_largest_bucket(&mut self) -> Result<bool> {
        let victim = self
            .buckets
            .iter()
            .enumerate()
            .filter_map(|(i, bucket)| match bucket {
                Bucket::Resident(b) if !b.entries.is_empty() => Some((i, b.bytes)),
                _ => None,
            })
            .max_by_key(|(_, bytes)| *bytes)
            .map(|(i, _)| i);

        let Some(index) = victim else {
            return Ok(false);
        };

        let mut file = SpillFile::create(
            &self.settings.spill_directory,
            &format!("solution-set-p{}-b{}-", self.partition, index),
            self.settings.retry,
        )?;

        let Bucket::Resident(resident) = &self.buckets[index] else {
            return Ok(false);
        };
        let mut keys: Vec<Key> = resident.entries.keys().copied().collect();
        keys.sort_unstable();
        let mut spill_index = HashMap::with_capacity(keys.len());
        let mut live_bytes = 0;
        for key in keys {
            if let Some(record) = resident.entries.get(&key) {
                let (offset, frame) = file.append(record)?;
                spill_index.insert(key, (offset, frame));
                live_bytes += frame;
            }
        }
        let freed = resident.bytes;
        self.buckets[index] = Bucket::Spilled(SpilledBucket {
            file,
            index: spill_index,
            live_bytes,
            dead_bytes: 0,
        });
        self.resident_bytes -= freed;
        self.stats.spills += 1;

        log_store_operation(
            events::STORE_SPILLED,
            self.partition,
            self.len,
            self.resident_bytes,
            self.spilled_bucket_count(),
            Some(&format!("bucket {index} freed {freed} bytes")),
        );
        Ok(true)
    }

    /// Rewrite a spilled bucket keeping only the live version of each key
    fn compact(&mut self, index: usize) -> Result<()> {
        let Bucket::Spilled(bucket) = &mut self.buckets[index] else {
            return Ok(());
        };
        let mut file = SpillFile::create(
            &self.settings.spill_directory,
            &format!("solution-set-p{}-b{}-", self.partition, index),
            self.settings.retry,
        )?;
        let mut live: Vec<(Key, u64)> = bucket
            .index
            .iter()
            .map(|(key, (offset, _))| (*key, *offset))
            .collect();
        live.sort_unstable_by_key(|(_, offset)| *offset);

        let mut new_index = HashMap::with_capacity(live.len());
        let mut live_bytes = 0;
        for (key, offset) in live {
            let record = bucket.file.read_at(offset)?;
            let (new_offset, frame) = file.append(&record)?;
            new_index.insert(key, (new_offset, frame));
            live_bytes += frame;
        }
        let reclaimed = bucket.dead_bytes;
        bucket.file = file;
        bucket.index = new_index;
        bucket.live_bytes = live_bytes;
        bucket.dead_bytes = 0;
        self.stats.compactions += 1;

        log_store_operation(
            events::STORE_COMPACTED,
            self.partition,
            self.len,
            self.resident_bytes,
            self.spilled_bucket_count(),
            Some(&format!("bucket {index} reclaimed {reclaimed} bytes")),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Field;

    fn settings(dir: &std::path::Path, budget: usize) -> StoreSettings {
        StoreSettings {
            memory_budget_bytes: budget,
            max_record_bytes: budget.min(4096),
            buckets: 4,
            spill_directory: dir.to_path_buf(),
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn test_build_probe_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyedPartitionStore::build(
            0,
            settings(dir.path(), 1 << 20),
            (1..=10).map(|k| Record::pair(k, k)),
        )
        .unwrap();

        assert_eq!(store.len(), 10);
        assert_eq!(store.probe(3).unwrap(), Some(Record::pair(3, 3)));
        assert_eq!(store.probe(11).unwrap(), None);

        store.update(Record::pair(3, 1)).unwrap();
        assert_eq!(store.probe(3).unwrap(), Some(Record::pair(3, 1)));
        store.update_without_reprobe(Record::pair(4, 2)).unwrap();
        assert_eq!(store.probe(4).unwrap(), Some(Record::pair(4, 2)));
        assert_eq!(store.len(), 10);
        assert_eq!(store.stats().reprobes, 1);
    }

    #[test]
    fn test_duplicate_keys_during_build_keep_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyedPartitionStore::build(
            0,
            settings(dir.path(), 1 << 20),
            vec![Record::pair(1, 5), Record::pair(1, 9)],
        )
        .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.probe(1).unwrap(), Some(Record::pair(1, 9)));
    }

    #[test]
    fn test_update_of_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store =
            KeyedPartitionStore::build(2, settings(dir.path(), 1 << 20), vec![Record::pair(1, 1)])
                .unwrap();
        assert!(matches!(
            store.update(Record::pair(99, 1)),
            Err(IterationError::UnknownSolutionSetKey { partition: 2, key: 99 })
        ));
    }

    #[test]
    fn test_oversized_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let huge = Record::new(1, vec![Field::Bytes(vec![0u8; 10_000])]);
        let result = KeyedPartitionStore::build(0, settings(dir.path(), 1 << 20), vec![huge]);
        assert!(matches!(
            result,
            Err(IterationError::StoreCapacityExceeded { key: 1, .. })
        ));
    }

    #[test]
    fn test_spills_under_small_budget_and_probes_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyedPartitionStore::build(
            0,
            settings(dir.path(), 2_000),
            (1..=200).map(|k| Record::pair(k, k * 10)),
        )
        .unwrap();

        assert!(store.spilled_bucket_count() > 0);
        assert!(store.resident_bytes() <= 2_000);
        assert_eq!(store.len(), 200);
        for key in 1..=200 {
            assert_eq!(store.probe(key).unwrap(), Some(Record::pair(key, key * 10)));
        }

        for key in 1..=200 {
            store.update(Record::pair(key, -key)).unwrap();
        }
        let mut entries = store.entries().unwrap();
        entries.sort_by_key(|r| r.key);
        assert_eq!(entries.len(), 200);
        assert!(entries.iter().all(|r| r.long(0) == Some(-r.key)));
    }

    #[test]
    fn test_spilled_doubles_keep_their_bits() {
        let dir = tempfile::tempdir().unwrap();
        let specials = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY];
        let value = |key: i64| specials[key as usize % specials.len()];
        let mut store = KeyedPartitionStore::build(
            0,
            settings(dir.path(), 256),
            (0..20).map(|k| Record::new(k, vec![Field::Double(value(k))])),
        )
        .unwrap();
        assert!(store.spilled_bucket_count() > 0);

        for key in 0..20 {
            match store.probe(key).unwrap().and_then(|r| r.field(0).cloned()) {
                Some(Field::Double(read)) => assert_eq!(read.to_bits(), value(key).to_bits()),
                other => panic!("key {key}: expected a double, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_repeated_updates_compact_spilled_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyedPartitionStore::build(
            0,
            settings(dir.path(), 500),
            (1..=50).map(|k| Record::pair(k, 0)),
        )
        .unwrap();
        for round in 0..200 {
            for key in 1..=50 {
                store.update_without_reprobe(Record::pair(key, round)).unwrap();
            }
        }
        assert!(store.stats().compactions > 0);
        for key in 1..=50 {
            assert_eq!(store.probe(key).unwrap(), Some(Record::pair(key, 199)));
        }
    }

    #[test]
    fn test_keys_cover_resident_and_spilled() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedPartitionStore::build(
            0,
            settings(dir.path(), 1_000),
            (1..=100).map(|k| Record::pair(k, k)),
        )
        .unwrap();
        let mut keys = store.keys();
        keys.sort_unstable();
        assert_eq!(keys, (1..=100).collect::<Vec<_>>());
    }
}
