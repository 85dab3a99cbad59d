//! Handshake between the writer path and the component that persists
//! immutable memtables.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::memtable::MemTableIter;
use super::types::{Entry, SeqNum};
use crate::error::{Error, Result};

/// What a flush sink needs to know about the table it is persisting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlushMetadata {
    pub memtable_id: u64,
    pub first_sequence: Option<SeqNum>,
    pub largest_sequence: Option<SeqNum>,
    /// WAL segment active when the table was created. Segments older than
    /// this hold no data for the table.
    pub log_number: u64,
    pub entry_count: usize,
    pub approximate_bytes: usize,
}

/// Identity of the persisted table reported back by the sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlushOutcome {
    pub file_number: u64,
    /// Every sequence up to this one is durable outside the WAL.
    pub largest_sequence: SeqNum,
}

type Callback = Box<dyn FnOnce(Result<FlushOutcome>) + Send>;

/// One-shot token a sink uses to report the end of a flush. Dropping it
/// without calling [`FlushCompletion::complete`] reports a failure.
pub struct FlushCompletion {
    memtable_id: u64,
    callback: Option<Callback>,
}

impl FlushCompletion {
    pub(crate) fn new(memtable_id: u64, callback: impl FnOnce(Result<FlushOutcome>) + Send + 'static) -> Self {
        Self {
            memtable_id,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn memtable_id(&self) -> u64 {
        self.memtable_id
    }

    pub fn complete(mut self, result: Result<FlushOutcome>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for FlushCompletion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!(memtable_id = self.memtable_id, "flush completion dropped unanswered");
            callback(Err(Error::Flush(format!(
                "sink dropped the completion for memtable {}",
                self.memtable_id
            ))));
        }
    }
}

/// Persists immutable memtables. Implementations may finish inline or hand
/// the work to another thread; either way `completion` must eventually be
/// completed or dropped.
pub trait FlushSink: Send + Sync {
    fn write_table(&self, metadata: FlushMetadata, entries: MemTableIter, completion: FlushCompletion);
}

/// A table written by [`MemorySink`].
#[derive(Clone, Debug)]
pub struct FlushedTable {
    pub file_number: u64,
    pub metadata: FlushMetadata,
    pub entries: Vec<Entry>,
}

#[derive(Default)]
struct MemorySinkState {
    tables: Vec<FlushedTable>,
    next_file: u64,
    failing: bool,
}

/// Keeps flushed tables in memory. Used by tests, benches and the stress
/// driver in place of a sorted-table writer.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following flush fail until turned off again.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn tables(&self) -> Vec<FlushedTable> {
        self.state.lock().tables.clone()
    }

    pub fn table_count(&self) -> usize {
        self.state.lock().tables.len()
    }
}

impl FlushSink for MemorySink {
    fn write_table(&self, metadata: FlushMetadata, entries: MemTableIter, completion: FlushCompletion) {
        let mut state = self.state.lock();
        if state.failing {
            drop(state);
            completion.complete(Err(Error::Flush("sink is failing".into())));
            return;
        }

        state.next_file += 1;
        let file_number = state.next_file;
        let largest_sequence = metadata.largest_sequence.unwrap_or(0);
        state.tables.push(FlushedTable {
            file_number,
            metadata,
            entries: entries.collect(),
        });
        drop(state);

        completion.complete(Ok(FlushOutcome {
            file_number,
            largest_sequence,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsm::memtable::{MemTable, MemTableOptions};
    use crate::lsm::types::ValueType;
    use std::sync::mpsc;

    #[test]
    fn test_dropped_completion_reports_failure() {
        let (tx, rx) = mpsc::channel();
        let completion = FlushCompletion::new(4, move |result| tx.send(result).unwrap());
        drop(completion);
        assert!(matches!(rx.recv().unwrap(), Err(Error::Flush(_))));
    }

    #[test]
    fn test_memory_sink_collects_entries() {
        let mem = MemTable::create(1, 1, &MemTableOptions::default(), None);
        mem.add(1, ValueType::Put, b"a", b"1").unwrap();
        mem.add(2, ValueType::Put, b"b", b"2").unwrap();
        mem.request_flush().unwrap();
        let job = mem.begin_flush().unwrap();

        let sink = MemorySink::new();
        let (tx, rx) = mpsc::channel();
        sink.write_table(
            job.metadata,
            job.entries,
            FlushCompletion::new(1, move |result| tx.send(result).unwrap()),
        );

        let outcome = rx.recv().unwrap().unwrap();
        assert_eq!(outcome.largest_sequence, 2);
        let tables = sink.tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].entries.len(), 2);
        job.ticket.complete(&outcome).unwrap();
    }

    #[test]
    fn test_failing_sink() {
        let mem = MemTable::create(1, 1, &MemTableOptions::default(), None);
        mem.request_flush().unwrap();
        let job = mem.begin_flush().unwrap();

        let sink = MemorySink::new();
        sink.set_failing(true);
        let (tx, rx) = mpsc::channel();
        sink.write_table(
            job.metadata,
            job.entries,
            FlushCompletion::new(1, move |result| tx.send(result).unwrap()),
        );
        assert!(rx.recv().unwrap().is_err());
        assert_eq!(sink.table_count(), 0);
        job.ticket.abort().unwrap();
    }
}
