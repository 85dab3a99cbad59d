//! In-memory sorted multi-version table for fast writes.
//!
//! The MemTable stores entries sorted by [`InternalKey`] in a lock-free skip
//! list, so lookups and scans run concurrently with inserts. Every write is a
//! new version; nothing is overwritten in place. Value bytes live in an
//! [`Arena`] released in one step when the table is destroyed.
//!
//! Lifetime is reference counted through [`MemTableRef`]: cloning a handle is
//! a `Ref`, dropping it an `Unref`. The table is destroyed exactly once, when
//! the count is zero *and* its flush has completed, whichever happens last.

use std::collections::VecDeque;
use std::ops::{Bound, Deref};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use tracing::debug;

use super::arena::{Arena, ArenaHandle};
use super::flush::{FlushMetadata, FlushOutcome};
use super::merge::MergeOperator;
use super::types::{Entry, InternalKey, Key, SeqNum, Value, ValueType};
use crate::constants::{DEFAULT_ARENA_BLOCK_SIZE, MEMTABLE_ENTRY_OVERHEAD};
use crate::error::{Error, Result};

/// Flush progress of a memtable. Transitions only move forward, except a
/// failed flush which returns to `FlushRequested`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushState {
    Active = 0,
    FlushRequested = 1,
    FlushInProgress = 2,
    Flushed = 3,
}

impl FlushState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => FlushState::Active,
            1 => FlushState::FlushRequested,
            2 => FlushState::FlushInProgress,
            _ => FlushState::Flushed,
        }
    }
}

/// Outcome of a point lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupResult {
    /// A value, possibly produced by folding merge operands onto a put.
    Found(Value),
    /// The newest visible version is a delete.
    NotFound,
    /// Only merge operands (oldest first) were visible; the persisted tables
    /// must supply the base value.
    MergeInProgress(Vec<Vec<u8>>),
    /// No version of the key at all.
    Absent,
}

#[derive(Clone, Debug)]
pub struct MemTableOptions {
    pub arena_block_size: usize,
    /// Zero means unlimited.
    pub arena_limit_bytes: usize,
}

impl Default for MemTableOptions {
    fn default() -> Self {
        Self {
            arena_block_size: DEFAULT_ARENA_BLOCK_SIZE,
            arena_limit_bytes: 0,
        }
    }
}

pub struct MemTable {
    id: u64,
    /// WAL segment that was active when this table was created.
    log_number: u64,
    table: SkipMap<InternalKey, ArenaHandle>,
    arena: Arena,
    /// Key bytes and node overhead, which live outside the arena.
    overhead_bytes: AtomicUsize,
    entry_count: AtomicUsize,
    first_sequence: AtomicU64,
    largest_sequence: AtomicU64,
    flush_state: AtomicU8,
    flushed_file: AtomicU64,
    refs: AtomicUsize,
    destroyed: AtomicBool,
    merge_operator: Option<Arc<dyn MergeOperator>>,
}

impl MemTable {
    /// Creates an empty memtable holding one reference.
    pub fn create(
        id: u64,
        log_number: u64,
        options: &MemTableOptions,
        merge_operator: Option<Arc<dyn MergeOperator>>,
    ) -> MemTableRef {
        let table = Self {
            id,
            log_number,
            table: SkipMap::new(),
            arena: Arena::new(options.arena_block_size, options.arena_limit_bytes),
            overhead_bytes: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            first_sequence: AtomicU64::new(SeqNum::MAX),
            largest_sequence: AtomicU64::new(0),
            flush_state: AtomicU8::new(FlushState::Active as u8),
            flushed_file: AtomicU64::new(0),
            refs: AtomicUsize::new(1),
            destroyed: AtomicBool::new(false),
            merge_operator,
        };
        MemTableRef {
            inner: Arc::new(table),
        }
    }

    /// Inserts one versioned entry.
    pub fn add(&self, seq: SeqNum, value_type: ValueType, key: &[u8], value: &[u8]) -> Result<()> {
        if self.flush_state() != FlushState::Active {
            return Err(Error::ImmutableMemTable { memtable_id: self.id });
        }

        let handle = self.arena.allocate(value)?;
        self.overhead_bytes
            .fetch_add(key.len() + MEMTABLE_ENTRY_OVERHEAD, Ordering::Relaxed);
        self.table
            .insert(InternalKey::new(Key::from_slice(key), seq, value_type), handle);

        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.first_sequence.fetch_min(seq, Ordering::AcqRel);
        self.largest_sequence.fetch_max(seq, Ordering::AcqRel);
        Ok(())
    }

    /// Looks up `key` as of `snapshot`.
    pub fn get(&self, key: &[u8], snapshot: SeqNum) -> Result<LookupResult> {
        let mut operands = VecDeque::new();
        Ok(match self.get_into(key, snapshot, &mut operands)? {
            Some(result) => result,
            None if operands.is_empty() => LookupResult::Absent,
            None => LookupResult::MergeInProgress(operands.into()),
        })
    }

    /// Walks the versions of `key` visible at `snapshot`, newest first,
    /// prepending merge operands to `operands`. Returns `None` if the chain
    /// ends without a put or delete, so the caller can continue in an older
    /// table with the operands gathered so far.
    pub fn get_into(
        &self,
        key: &[u8],
        snapshot: SeqNum,
        operands: &mut VecDeque<Vec<u8>>,
    ) -> Result<Option<LookupResult>> {
        let start = InternalKey::lookup(key, snapshot);
        let end = InternalKey::new(Key::from_slice(key), 0, ValueType::Delete);

        for entry in self.table.range(start..=end) {
            let value = self.arena.get(*entry.value());
            match entry.key().value_type {
                ValueType::Put => return self.terminate(&entry.key().user_key, Some(value), operands).map(Some),
                ValueType::Delete => return self.terminate(&entry.key().user_key, None, operands).map(Some),
                ValueType::Merge => operands.push_front(value.to_vec()),
            }
        }
        Ok(None)
    }

    fn terminate(
        &self,
        key: &Key,
        base: Option<&[u8]>,
        operands: &mut VecDeque<Vec<u8>>,
    ) -> Result<LookupResult> {
        if operands.is_empty() {
            return Ok(match base {
                Some(value) => LookupResult::Found(Value::from_slice(value)),
                None => LookupResult::NotFound,
            });
        }

        let operator = self.merge_operator.as_ref().ok_or(Error::MergeOperatorMissing)?;
        let operands: Vec<Vec<u8>> = operands.drain(..).collect();
        let merged = operator.full_merge(key, base, &operands)?;
        Ok(LookupResult::Found(Value::new(merged)))
    }

    /// Arena bytes plus key and node overhead. Never decreases while the
    /// table is alive.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage() + self.overhead_bytes.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the oldest entry, `None` while empty.
    pub fn first_sequence(&self) -> Option<SeqNum> {
        match self.first_sequence.load(Ordering::Acquire) {
            SeqNum::MAX => None,
            seq => Some(seq),
        }
    }

    pub fn largest_sequence(&self) -> Option<SeqNum> {
        match self.largest_sequence.load(Ordering::Acquire) {
            0 => None,
            seq => Some(seq),
        }
    }

    pub fn flush_state(&self) -> FlushState {
        FlushState::from_u8(self.flush_state.load(Ordering::SeqCst))
    }

    /// File the table was flushed into, once flushed.
    pub fn flushed_file_number(&self) -> Option<u64> {
        match self.flush_state() {
            FlushState::Flushed => Some(self.flushed_file.load(Ordering::Acquire)),
            _ => None,
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Stops accepting writes and queues the table for flushing.
    pub fn request_flush(&self) -> Result<()> {
        self.transition(FlushState::Active, FlushState::FlushRequested)
    }

    fn transition(&self, from: FlushState, to: FlushState) -> Result<()> {
        self.flush_state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| Error::InvalidFlushTransition {
                memtable_id: self.id,
                from: FlushState::from_u8(actual),
                to,
            })
    }

    fn metadata(&self) -> FlushMetadata {
        FlushMetadata {
            memtable_id: self.id,
            first_sequence: self.first_sequence(),
            largest_sequence: self.largest_sequence(),
            log_number: self.log_number,
            entry_count: self.len(),
            approximate_bytes: self.approximate_memory_usage(),
        }
    }

    fn unref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "memtable {} unreferenced below zero", self.id);
        if prev == 1 && self.flush_state() == FlushState::Flushed {
            self.destroy();
        }
    }

    fn destroy(&self) {
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let reclaimed = self.approximate_memory_usage();
            self.table.clear();
            self.arena.release();
            debug!(memtable_id = self.id, reclaimed, "memtable destroyed");
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Counted reference to a [`MemTable`]. Clone is `Ref`, drop is `Unref`.
pub struct MemTableRef {
    inner: Arc<MemTable>,
}

impl MemTableRef {
    /// Lazy iterator over every entry in [`InternalKey`] order. The iterator
    /// holds its own reference, so the table outlives it.
    pub fn iter(&self) -> MemTableIter {
        MemTableIter {
            table: self.clone(),
            last: None,
        }
    }

    /// Moves a flush-requested table into `FlushInProgress` and hands out
    /// what a flush sink needs. Starting a second flush of the same table is
    /// a consistency error.
    pub fn begin_flush(&self) -> Result<FlushJob> {
        self.inner
            .transition(FlushState::FlushRequested, FlushState::FlushInProgress)?;
        debug!(memtable_id = self.inner.id, entries = self.inner.len(), "flush started");
        Ok(FlushJob {
            metadata: self.inner.metadata(),
            entries: self.iter(),
            ticket: FlushTicket {
                table: Arc::clone(&self.inner),
            },
        })
    }

    pub fn ptr_eq(&self, other: &MemTableRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Clone for MemTableRef {
    fn clone(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for MemTableRef {
    fn drop(&mut self) {
        self.inner.unref();
    }
}

impl Deref for MemTableRef {
    type Target = MemTable;

    fn deref(&self) -> &MemTable {
        &self.inner
    }
}

/// Everything a flush needs: metadata, the ordered entries, and the ticket
/// used to report the result.
pub struct FlushJob {
    pub metadata: FlushMetadata,
    pub entries: MemTableIter,
    pub ticket: FlushTicket,
}

/// Non-owning back-reference from the flush scheduler to the table being
/// flushed. It does not count as a reference and cannot read entries.
pub struct FlushTicket {
    table: Arc<MemTable>,
}

impl FlushTicket {
    pub fn memtable_id(&self) -> u64 {
        self.table.id
    }

    /// Marks the flush done. Destroys the table if nothing references it.
    pub fn complete(self, outcome: &FlushOutcome) -> Result<()> {
        self.table.flushed_file.store(outcome.file_number, Ordering::Release);
        self.table
            .transition(FlushState::FlushInProgress, FlushState::Flushed)?;
        if self.table.ref_count() == 0 {
            self.table.destroy();
        }
        Ok(())
    }

    /// Returns the table to `FlushRequested` so the flush can be retried.
    pub fn abort(self) -> Result<()> {
        self.table
            .transition(FlushState::FlushInProgress, FlushState::FlushRequested)
    }
}

pub struct MemTableIter {
    table: MemTableRef,
    last: Option<InternalKey>,
}

impl Iterator for MemTableIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let entry = match self.last.as_ref() {
            None => self.table.table.front(),
            Some(last) => {
                let bounds: (Bound<&InternalKey>, Bound<&InternalKey>) =
                    (Bound::Excluded(last), Bound::Unbounded);
                self.table.table.range(bounds).next()
            }
        }?;

        let key = entry.key().clone();
        let value = Value::from_slice(self.table.arena.get(*entry.value()));
        drop(entry);

        self.last = Some(key.clone());
        Some(Entry {
            key: key.user_key,
            seq_num: key.sequence,
            value_type: key.value_type,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsm::merge::DecimalAddOperator;
    use std::thread;

    fn new_table() -> MemTableRef {
        MemTable::create(1, 1, &MemTableOptions::default(), None)
    }

    fn outcome(file_number: u64) -> FlushOutcome {
        FlushOutcome {
            file_number,
            largest_sequence: 0,
        }
    }

    #[test]
    fn test_add_and_get() {
        let mem = new_table();
        mem.add(1, ValueType::Put, b"key1", b"value1").unwrap();
        mem.add(2, ValueType::Put, b"key2", b"value2").unwrap();

        assert_eq!(mem.get(b"key1", 10).unwrap(), LookupResult::Found(Value::from("value1")));
        assert_eq!(mem.get(b"key2", 10).unwrap(), LookupResult::Found(Value::from("value2")));
        assert_eq!(mem.get(b"key3", 10).unwrap(), LookupResult::Absent);
    }

    #[test]
    fn test_delete_hides_older_put() {
        let mem = new_table();
        mem.add(5, ValueType::Put, b"a", b"x").unwrap();
        mem.add(7, ValueType::Delete, b"a", b"").unwrap();

        assert_eq!(mem.get(b"a", 10).unwrap(), LookupResult::NotFound);
        assert_eq!(mem.get(b"a", 6).unwrap(), LookupResult::Found(Value::from("x")));
        assert_eq!(mem.get(b"a", 4).unwrap(), LookupResult::Absent);
    }

    #[test]
    fn test_snapshot_sees_largest_sequence_below() {
        let mem = new_table();
        for seq in 1..=10u64 {
            mem.add(seq, ValueType::Put, b"k", format!("v{seq}").as_bytes()).unwrap();
        }
        for snapshot in 1..=10u64 {
            assert_eq!(
                mem.get(b"k", snapshot).unwrap(),
                LookupResult::Found(Value::from(format!("v{snapshot}").as_str()))
            );
        }
        assert_eq!(mem.get(b"k", 100).unwrap(), LookupResult::Found(Value::from("v10")));
    }

    #[test]
    fn test_merge_in_progress_keeps_operand_order() {
        let mem = new_table();
        mem.add(1, ValueType::Merge, b"a", b"+1").unwrap();
        mem.add(2, ValueType::Merge, b"a", b"+2").unwrap();

        assert_eq!(
            mem.get(b"a", 2).unwrap(),
            LookupResult::MergeInProgress(vec![b"+1".to_vec(), b"+2".to_vec()])
        );
        assert_eq!(
            mem.get(b"a", 1).unwrap(),
            LookupResult::MergeInProgress(vec![b"+1".to_vec()])
        );
    }

    #[test]
    fn test_merge_folds_onto_put_and_delete() {
        let mem = MemTable::create(1, 1, &MemTableOptions::default(), Some(Arc::new(DecimalAddOperator)));
        mem.add(1, ValueType::Put, b"a", b"10").unwrap();
        mem.add(2, ValueType::Merge, b"a", b"+5").unwrap();
        mem.add(3, ValueType::Delete, b"b", b"").unwrap();
        mem.add(4, ValueType::Merge, b"b", b"+2").unwrap();

        assert_eq!(mem.get(b"a", 10).unwrap(), LookupResult::Found(Value::from("15")));
        assert_eq!(mem.get(b"a", 1).unwrap(), LookupResult::Found(Value::from("10")));
        assert_eq!(mem.get(b"b", 10).unwrap(), LookupResult::Found(Value::from("2")));
    }

    #[test]
    fn test_merge_onto_put_without_operator_fails() {
        let mem = new_table();
        mem.add(1, ValueType::Put, b"a", b"10").unwrap();
        mem.add(2, ValueType::Merge, b"a", b"+5").unwrap();
        assert!(matches!(mem.get(b"a", 2), Err(Error::MergeOperatorMissing)));
    }

    #[test]
    fn test_iter_order() {
        let mem = new_table();
        mem.add(1, ValueType::Put, b"c", b"3").unwrap();
        mem.add(2, ValueType::Put, b"a", b"1").unwrap();
        mem.add(3, ValueType::Put, b"b", b"2").unwrap();
        mem.add(4, ValueType::Put, b"a", b"1b").unwrap();

        let entries: Vec<_> = mem.iter().collect();
        let order: Vec<_> = entries.iter().map(|e| (e.key.as_bytes().to_vec(), e.seq_num)).collect();
        assert_eq!(
            order,
            vec![(b"a".to_vec(), 4), (b"a".to_vec(), 2), (b"b".to_vec(), 3), (b"c".to_vec(), 1)]
        );
        assert_eq!(entries[0].value.as_bytes(), b"1b");
    }

    #[test]
    fn test_memory_usage_is_monotonic() {
        let mem = new_table();
        let mut last = mem.approximate_memory_usage();
        for seq in 1..200u64 {
            mem.add(seq, ValueType::Put, &seq.to_be_bytes(), &[0u8; 100]).unwrap();
            let usage = mem.approximate_memory_usage();
            assert!(usage >= last);
            last = usage;
        }
        assert!(last >= 199 * 100);
        assert_eq!(mem.first_sequence(), Some(1));
        assert_eq!(mem.largest_sequence(), Some(199));
    }

    #[test]
    fn test_ref_unref_restores_count() {
        let mem = new_table();
        assert_eq!(mem.ref_count(), 1);
        let extra = mem.clone();
        assert_eq!(mem.ref_count(), 2);
        drop(extra);
        assert_eq!(mem.ref_count(), 1);
    }

    #[test]
    fn test_destroyed_after_flush_when_unreferenced_last() {
        let mem = new_table();
        mem.add(1, ValueType::Put, b"a", b"1").unwrap();
        let inner = Arc::clone(&mem.inner);

        mem.request_flush().unwrap();
        let job = mem.begin_flush().unwrap();
        assert_eq!(job.metadata.first_sequence, Some(1));
        let flushed: Vec<_> = job.entries.collect();
        assert_eq!(flushed.len(), 1);

        job.ticket.complete(&outcome(9)).unwrap();
        // Still referenced by `mem`.
        assert!(!inner.is_destroyed());
        assert_eq!(mem.flushed_file_number(), Some(9));

        drop(mem);
        assert!(inner.is_destroyed());
        assert!(inner.arena.is_released());
        assert_eq!(inner.ref_count(), 0);
    }

    #[test]
    fn test_destroyed_when_flush_completes_after_last_unref() {
        let mem = new_table();
        mem.add(1, ValueType::Put, b"a", b"1").unwrap();
        let inner = Arc::clone(&mem.inner);

        mem.request_flush().unwrap();
        let job = mem.begin_flush().unwrap();
        drop(job.entries);
        drop(mem);
        assert_eq!(inner.ref_count(), 0);
        assert!(!inner.is_destroyed(), "unflushed table must survive unref to zero");

        job.ticket.complete(&outcome(3)).unwrap();
        assert!(inner.is_destroyed());
    }

    #[test]
    fn test_iterator_keeps_table_alive() {
        let mem = new_table();
        mem.add(1, ValueType::Put, b"a", b"1").unwrap();
        mem.add(2, ValueType::Put, b"b", b"2").unwrap();
        let inner = Arc::clone(&mem.inner);

        mem.request_flush().unwrap();
        let job = mem.begin_flush().unwrap();
        let mut entries = job.entries;
        job.ticket.complete(&outcome(1)).unwrap();
        drop(mem);

        assert!(!inner.is_destroyed());
        assert_eq!(entries.next().unwrap().key.as_bytes(), b"a");
        assert_eq!(entries.next().unwrap().key.as_bytes(), b"b");
        assert!(entries.next().is_none());
        drop(entries);
        assert!(inner.is_destroyed());
    }

    #[test]
    fn test_double_flush_is_rejected() {
        let mem = new_table();
        mem.request_flush().unwrap();
        assert!(matches!(mem.request_flush(), Err(Error::InvalidFlushTransition { .. })));

        let job = mem.begin_flush().unwrap();
        let err = mem.begin_flush().err().unwrap();
        assert!(err.is_fatal());

        job.ticket.complete(&outcome(1)).unwrap();
        assert!(mem.begin_flush().is_err());
    }

    #[test]
    fn test_aborted_flush_can_be_retried() {
        let mem = new_table();
        mem.request_flush().unwrap();
        let job = mem.begin_flush().unwrap();
        job.ticket.abort().unwrap();
        assert_eq!(mem.flush_state(), FlushState::FlushRequested);

        let retry = mem.begin_flush().unwrap();
        retry.ticket.complete(&outcome(2)).unwrap();
        assert_eq!(mem.flush_state(), FlushState::Flushed);
    }

    #[test]
    fn test_add_after_flush_request_is_rejected() {
        let mem = new_table();
        mem.request_flush().unwrap();
        let err = mem.add(1, ValueType::Put, b"a", b"1").unwrap_err();
        assert!(matches!(err, Error::ImmutableMemTable { memtable_id: 1 }));
    }

    #[test]
    fn test_arena_exhaustion_surfaces() {
        let options = MemTableOptions {
            arena_block_size: 64,
            arena_limit_bytes: 256,
        };
        let mem = MemTable::create(1, 1, &options, None);
        let result = (1..100u64).try_for_each(|seq| mem.add(seq, ValueType::Put, b"k", &[0u8; 100]));
        assert!(matches!(result, Err(Error::ArenaExhausted { limit: 256 })));
    }

    #[test]
    fn test_concurrent_add_and_get() {
        let mem = new_table();
        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let mem = mem.clone();
                thread::spawn(move || {
                    for i in 0..250u64 {
                        let seq = t * 250 + i + 1;
                        mem.add(seq, ValueType::Put, format!("key{seq}").as_bytes(), &seq.to_le_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let mem = mem.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    if let LookupResult::Found(v) = mem.get(b"key1", u64::MAX).unwrap() {
                        assert_eq!(v.as_bytes(), &1u64.to_le_bytes());
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(mem.len(), 1000);
        assert_eq!(mem.iter().count(), 1000);
        assert_eq!(mem.ref_count(), 1);
    }
}
