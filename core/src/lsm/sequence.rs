//! Sequence number allocation and publication.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::types::{SeqNum, SequenceRange};
use crate::error::{Error, Result};

/// Issues strictly increasing sequence numbers, one per write.
///
/// Numbers are never reused. After a restart the allocator must be built with
/// [`SequenceAllocator::resume_after`] from the largest sequence observed in
/// the retained log and the persisted tables.
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    /// A fresh allocator; the first number issued is 1.
    pub fn new() -> Self {
        Self::resume_after(0)
    }

    pub fn resume_after(max_observed: SeqNum) -> Self {
        Self {
            next: AtomicU64::new(max_observed.saturating_add(1)),
        }
    }

    /// Reserves `count` consecutive numbers and returns the first one.
    pub fn next(&self, count: u64) -> Result<SeqNum> {
        if count == 0 {
            return Err(Error::InvalidArgument("cannot reserve zero sequence numbers".into()));
        }
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| next.checked_add(count))
            .map_err(|_| Error::SequenceOverflow)
    }

    /// Reserves numbers for a batch of `count` writes.
    pub fn next_range(&self, count: u64) -> Result<SequenceRange> {
        let first = self.next(count)?;
        Ok(SequenceRange {
            first,
            last: first + count - 1,
        })
    }

    /// The number the next reservation will start at.
    pub fn peek_next(&self) -> SeqNum {
        self.next.load(Ordering::SeqCst)
    }

    /// Largest number handed out so far, 0 if none.
    pub fn last_allocated(&self) -> SeqNum {
        self.peek_next() - 1
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Highest sequence whose write is fully applied to the memtable.
///
/// Writers finish out of order; a range is published only once every lower
/// range has been published, so readers at the visible sequence never see a
/// newer write while an older one is still missing.
pub struct VisibleSequence {
    last: AtomicU64,
    pending: Mutex<BTreeMap<SeqNum, SeqNum>>,
}

impl VisibleSequence {
    pub fn new(last: SeqNum) -> Self {
        Self {
            last: AtomicU64::new(last),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self) -> SeqNum {
        self.last.load(Ordering::Acquire)
    }

    pub fn publish(&self, range: SequenceRange) {
        let mut pending = self.pending.lock();
        pending.insert(range.first, range.last);

        let mut last = self.last.load(Ordering::Acquire);
        while let Some(end) = pending.remove(&(last + 1)) {
            last = end;
        }
        self.last.store(last, Ordering::Release);
    }

    /// Number of completed ranges waiting on an older writer.
    pub fn pending_ranges(&self) -> usize {
        self.pending.lock().len()
    }
}
