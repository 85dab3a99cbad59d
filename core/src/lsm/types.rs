//! Core types for the write buffer and the log.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::varint::{get_varint, put_varint, varint_len};

/// Sequence number establishing the global write order.
/// Higher sequence numbers are newer. Zero is never assigned.
pub type SeqNum = u64;

/// Key type - variable length bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&[u8]> for Key {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

/// Value type - variable length bytes. Empty for deletes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Value(pub Vec<u8>);

impl Value {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Value {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

/// Kind of a versioned write. The discriminant is the on-disk tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    Delete = 0,
    Put = 1,
    Merge = 2,
}

impl ValueType {
    /// Highest tag; sorts first among entries sharing a key and sequence.
    pub const MAX: ValueType = ValueType::Merge;

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ValueType::Delete),
            1 => Some(ValueType::Put),
            2 => Some(ValueType::Merge),
            _ => None,
        }
    }
}

/// Sort key of the memtable: user key ascending, then sequence descending,
/// then value type descending. For one user key the newest version sorts
/// first, so a forward seek from `(key, snapshot)` lands on the version
/// visible at that snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct InternalKey {
    pub user_key: Key,
    pub sequence: SeqNum,
    pub value_type: ValueType,
}

impl InternalKey {
    pub fn new(user_key: Key, sequence: SeqNum, value_type: ValueType) -> Self {
        Self {
            user_key,
            sequence,
            value_type,
        }
    }

    /// The smallest internal key for `user_key` visible at `snapshot`.
    pub fn lookup(user_key: &[u8], snapshot: SeqNum) -> Self {
        Self::new(Key::from_slice(user_key), snapshot, ValueType::MAX)
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.value_type.cmp(&self.value_type))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A versioned write.
///
/// - `key`: The user key bytes
/// - `seq_num`: Sequence number for ordering (higher = newer)
/// - `value_type`: Put, Delete (tombstone) or Merge (operand)
/// - `value`: The value or merge operand; empty for deletes
#[derive(Clone, Debug)]
pub struct Entry {
    pub key: Key,
    pub seq_num: SeqNum,
    pub value_type: ValueType,
    pub value: Value,
}

impl Entry {
    pub fn put(key: Key, seq_num: SeqNum, value: Value) -> Self {
        Self {
            key,
            seq_num,
            value_type: ValueType::Put,
            value,
        }
    }

    pub fn delete(key: Key, seq_num: SeqNum) -> Self {
        Self {
            key,
            seq_num,
            value_type: ValueType::Delete,
            value: Value::default(),
        }
    }

    pub fn merge(key: Key, seq_num: SeqNum, operand: Value) -> Self {
        Self {
            key,
            seq_num,
            value_type: ValueType::Merge,
            value: operand,
        }
    }

    /// Returns true if this is a tombstone (delete marker).
    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Delete
    }

    pub fn internal_key(&self) -> InternalKey {
        InternalKey::new(self.key.clone(), self.seq_num, self.value_type)
    }
}

/// Ordering for entries follows [`InternalKey`]: key ascending, newest first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq_num.cmp(&self.seq_num))
            .then_with(|| other.value_type.cmp(&self.value_type))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Entry {}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq_num == other.seq_num && self.value_type == other.value_type
    }
}

/// Inclusive range of sequence numbers assigned to one write batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SequenceRange {
    pub first: SeqNum,
    pub last: SeqNum,
}

impl SequenceRange {
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn contains(&self, seq: SeqNum) -> bool {
        self.first <= seq && seq <= self.last
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchOp {
    pub value_type: ValueType,
    pub key: Key,
    pub value: Value,
}

/// Ordered writes that receive consecutive sequence numbers and are logged
/// as a single WAL record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> &mut Self {
        self.push(ValueType::Put, key.into(), value.into())
    }

    pub fn delete(&mut self, key: impl Into<Key>) -> &mut Self {
        self.push(ValueType::Delete, key.into(), Value::default())
    }

    pub fn merge(&mut self, key: impl Into<Key>, operand: impl Into<Value>) -> &mut Self {
        self.push(ValueType::Merge, key.into(), operand.into())
    }

    fn push(&mut self, value_type: ValueType, key: Key, value: Value) -> &mut Self {
        self.ops.push(BatchOp {
            value_type,
            key,
            value,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Entries of this batch when its first operation has sequence `first`.
    pub fn entries(&self, first: SeqNum) -> impl Iterator<Item = Entry> + '_ {
        self.ops.iter().enumerate().map(move |(i, op)| Entry {
            key: op.key.clone(),
            seq_num: first + i as u64,
            value_type: op.value_type,
            value: op.value.clone(),
        })
    }

    /// Encoded size of the operations, excluding the record header.
    pub fn encoded_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| {
                1 + varint_len(op.key.len() as u64)
                    + op.key.len()
                    + varint_len(op.value.len() as u64)
                    + op.value.len()
            })
            .sum()
    }

    /// Appends the operations to `buf`.
    ///
    /// Format per operation: type (1) + key_len (varint) + key + value_len (varint) + value
    pub(crate) fn encode_ops(&self, buf: &mut Vec<u8>) {
        for op in &self.ops {
            buf.push(op.value_type as u8);
            put_varint(buf, op.key.len() as u64);
            buf.extend_from_slice(op.key.as_bytes());
            put_varint(buf, op.value.len() as u64);
            buf.extend_from_slice(op.value.as_bytes());
        }
    }

    /// Decodes exactly `count` operations that must fill `data` completely.
    pub(crate) fn decode_ops(data: &[u8], count: usize) -> Result<Self> {
        let bad = |reason: &str| Error::InvalidArgument(format!("malformed batch: {reason}"));
        let mut ops = Vec::with_capacity(count);
        let mut offset = 0;

        for _ in 0..count {
            let tag = *data.get(offset).ok_or_else(|| bad("missing type"))?;
            let value_type = ValueType::from_u8(tag).ok_or_else(|| bad("unknown type"))?;
            offset += 1;

            let (key_len, read) = get_varint(&data[offset..]).ok_or_else(|| bad("key length"))?;
            offset += read;
            let key_end = offset
                .checked_add(key_len as usize)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| bad("key overruns record"))?;
            let key = Key::from_slice(&data[offset..key_end]);
            offset = key_end;

            let (value_len, read) = get_varint(&data[offset..]).ok_or_else(|| bad("value length"))?;
            offset += read;
            let value_end = offset
                .checked_add(value_len as usize)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| bad("value overruns record"))?;
            let value = Value::from_slice(&data[offset..value_end]);
            offset = value_end;

            ops.push(BatchOp {
                value_type,
                key,
                value,
            });
        }

        if offset != data.len() {
            return Err(bad("trailing bytes"));
        }
        Ok(Self { ops })
    }
}
