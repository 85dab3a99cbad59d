//! Replication cursor over the write-ahead log.
//!
//! A [`ChangeIterator`] replays committed write batches in strict sequence
//! order from a resume point, following the log across segment rotations.
//! It holds a retention lease so the segments it still needs are not
//! deleted under it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use super::retention::RetentionLease;
use super::types::{SeqNum, WriteBatch};
use super::wal::{SegmentReader, Wal};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorState {
    /// Moving to the next segment.
    Seeking,
    /// A batch is available.
    Streaming,
    /// Caught up with the durable log; call `next` or `wait_for_data` later.
    Exhausted,
    /// A gap, corruption or expiry was detected. The cursor must be reopened.
    Invalid,
}

/// A batch together with the sequence of its first operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchResult {
    pub sequence: SeqNum,
    pub batch: WriteBatch,
}

impl BatchResult {
    pub fn last_sequence(&self) -> SeqNum {
        self.sequence + self.batch.len() as u64 - 1
    }
}

pub struct ChangeIterator {
    wal: Arc<Wal>,
    lease: RetentionLease,
    state: CursorState,
    segment: u64,
    reader: Option<SegmentReader>,
    current: Option<BatchResult>,
    /// First sequence not yet handed to the consumer.
    next_expected: SeqNum,
    delivered: bool,
}

impl ChangeIterator {
    /// Positions a new cursor at `start`. The caller has already checked
    /// `start` against the oldest retained sequence and pinned it.
    pub(crate) fn new(wal: Arc<Wal>, lease: RetentionLease, start: SeqNum) -> Result<Self> {
        let segment = wal
            .segment_for(start)
            .ok_or_else(|| Error::HistoryUnavailable {
                requested: start,
                oldest: wal.earliest_available_sequence(),
            })?;

        // Past the end of the log: wait at the durable tail.
        let (offset, reader) = match segment.max_seq {
            Some(max) if max >= start => (0, None),
            _ => (segment.size, Some(wal.open_reader(segment.file_number, segment.size)?)),
        };

        let mut iter = Self {
            wal,
            lease,
            state: CursorState::Seeking,
            segment: segment.file_number,
            reader,
            current: None,
            next_expected: start,
            delivered: false,
        };
        debug!(
            cursor_id = iter.lease.id(),
            start,
            segment = iter.segment,
            offset,
            "change cursor opened"
        );
        iter.load()?;
        Ok(iter)
    }

    pub fn cursor_id(&self) -> u64 {
        self.lease.id()
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn valid(&self) -> bool {
        self.state == CursorState::Streaming && self.current.is_some()
    }

    pub fn get_batch(&self) -> Option<&BatchResult> {
        match self.state {
            CursorState::Streaming => self.current.as_ref(),
            _ => None,
        }
    }

    /// Sequence a refreshed cursor should start from: the current batch if
    /// one is loaded, else the first sequence not yet delivered.
    pub fn resume_sequence(&self) -> SeqNum {
        self.current.as_ref().map_or(self.next_expected, |b| b.sequence)
    }

    /// Consumes the current batch and loads the next one. From `Exhausted`
    /// it retries the tail of the log.
    pub fn next(&mut self) -> Result<()> {
        self.check_live()?;
        if self.state == CursorState::Streaming {
            if let Some(batch) = self.current.take() {
                self.next_expected = batch.last_sequence() + 1;
                self.delivered = true;
            }
        }
        self.load()
    }

    /// Parks until new data may be available or `timeout` passes, then
    /// retries. Returns whether a batch is available.
    pub fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        self.check_live()?;
        if self.state != CursorState::Exhausted {
            return Ok(self.valid());
        }
        self.lease.touch();
        self.wal.wait_for_sequence(self.next_expected, timeout);
        self.load()?;
        Ok(self.valid())
    }

    fn check_live(&mut self) -> Result<()> {
        if self.lease.is_expired() {
            self.state = CursorState::Invalid;
            return Err(Error::CursorExpired {
                cursor_id: self.lease.id(),
                resume_from: self.resume_sequence(),
            });
        }
        if self.state == CursorState::Invalid {
            return Err(Error::CursorInvalid);
        }
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        match self.load_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    error!(cursor_id = self.lease.id(), error = %e, "change cursor invalidated");
                }
                self.state = CursorState::Invalid;
                self.current = None;
                Err(e)
            }
        }
    }

    fn load_inner(&mut self) -> Result<()> {
        loop {
            let meta = self.wal.segment_meta(self.segment).ok_or_else(|| Error::HistoryUnavailable {
                requested: self.next_expected,
                oldest: self.wal.earliest_available_sequence(),
            })?;

            if self.reader.is_none() {
                self.reader = Some(self.wal.open_reader(meta.file_number, 0)?);
            }
            let record = match self.reader.as_mut() {
                Some(reader) => reader.read_next(meta.size)?,
                None => None,
            };

            match record {
                Some(record) => {
                    let range = record.range();
                    if range.last < self.next_expected && !self.delivered {
                        continue;
                    }
                    if range.first > self.next_expected || (self.delivered && range.first != self.next_expected) {
                        return Err(Error::SequenceGap {
                            expected: self.next_expected,
                            found: range.first,
                        });
                    }

                    self.lease.advance(range.first);
                    self.current = Some(BatchResult {
                        sequence: range.first,
                        batch: record.batch,
                    });
                    self.state = CursorState::Streaming;
                    return Ok(());
                }
                None if meta.is_sealed() => {
                    let Some(next) = self.wal.next_segment(self.segment) else {
                        self.state = CursorState::Exhausted;
                        return Ok(());
                    };
                    debug!(cursor_id = self.lease.id(), from = self.segment, to = next.file_number, "change cursor moved to next segment");
                    self.state = CursorState::Seeking;
                    self.segment = next.file_number;
                    self.reader = None;
                }
                None => {
                    self.lease.advance(self.next_expected);
                    self.state = CursorState::Exhausted;
                    return Ok(());
                }
            }
        }
    }
}
