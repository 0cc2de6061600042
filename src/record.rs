//! # Records and Partitioning
//!
//! A [`Record`] is an ordered tuple of typed fields whose first field is the key. Records
//! are plain values: they are cloned on fan-out and serialized when shipped over a
//! network edge or spilled to disk.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key type for solution sets, worksets and partitioning
pub type Key = i64;

/// A single payload field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Field {
    Long(i64),
    Double(#[serde(with = "f64_bits")] f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Field {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(value) => Some(*value),
            _ => None,
        }
    }

    /// Approximate in-memory footprint, used for memory budgets
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Long(_) | Self::Double(_) => 16,
            Self::Text(text) => 24 + text.len(),
            Self::Bytes(bytes) => 24 + bytes.len(),
        }
    }
}

/// Doubles cross the codec as their IEEE-754 bit pattern; JSON numbers cannot carry NaN or
/// the infinities.
mod f64_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

/// A keyed record flowing through the iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    pub payload: Vec<Field>,
}

impl Record {
    pub fn new(key: Key, payload: Vec<Field>) -> Self {
        Self { key, payload }
    }

    /// Record with a single `Long` payload field, the common shape for (key, value) pairs
    pub fn pair(key: Key, value: i64) -> Self {
        Self {
            key,
            payload: vec![Field::Long(value)],
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.payload.get(index)
    }

    /// Payload field `index` as a long, if present and of that type
    pub fn long(&self, index: usize) -> Option<i64> {
        self.field(index).and_then(Field::as_long)
    }

    pub fn set_field(&mut self, index: usize, field: Field) {
        if index >= self.payload.len() {
            self.payload.resize(index + 1, Field::Long(0));
        }
        self.payload[index] = field;
    }

    pub fn estimated_size(&self) -> usize {
        32 + self
            .payload
            .iter()
            .map(Field::estimated_size)
            .sum::<usize>()
    }

    pub fn encode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        for field in &self.payload {
            match field {
                Field::Long(v) => write!(f, " {v}")?,
                Field::Double(v) => write!(f, " {v}")?,
                Field::Text(v) => write!(f, " {v}")?,
                Field::Bytes(v) => write!(f, " <{} bytes>", v.len())?,
            }
        }
        Ok(())
    }
}

/// Deterministic key → partition assignment.
///
/// The mapping depends only on the key and the partition count, never on process state,
/// so a key lands in the same partition for the lifetime of a scope and across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    partitions: usize,
}

impl Partitioner {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn partition(&self, key: Key) -> usize {
        (mix64(key as u64) % self.partitions as u64) as usize
    }

    /// Split a record sequence into one vector per partition, preserving input order
    /// within each partition.
    pub fn split(&self, records: impl IntoIterator<Item = Record>) -> Vec<Vec<Record>> {
        let mut parts = vec![Vec::new(); self.partitions];
        for record in records {
            parts[self.partition(record.key)].push(record);
        }
        parts
    }
}

/// Finalizer of MurmurHash3; spreads sequential ids across partitions.
pub(crate) fn mix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}
