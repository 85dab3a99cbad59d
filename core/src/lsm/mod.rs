//! Write buffer, write-ahead log and replication cursor of an LSM engine.
//!
//! Architecture:
//! - MemTable: Concurrent multi-version skip list backed by an arena
//! - WAL: Segmented, checksummed log of write batches
//! - ChangeIterator: Ordered replay of committed batches for replication
//! - Db: Write path, memtable switch, flush installation and WAL purge

mod arena;
mod changes;
mod db;
mod flush;
mod memtable;
mod merge;
mod retention;
mod sequence;
mod types;
mod wal;

pub use arena::{Arena, ArenaHandle};
pub use changes::{BatchResult, ChangeIterator, CursorState};
pub use db::{Db, DbConfig, DbStats};
pub use flush::{FlushCompletion, FlushMetadata, FlushOutcome, FlushSink, FlushedTable, MemorySink};
pub use memtable::{FlushJob, FlushState, FlushTicket, LookupResult, MemTable, MemTableIter, MemTableOptions, MemTableRef};
pub use merge::{DecimalAddOperator, MergeOperator, resolve};
pub use retention::{RetentionLease, RetentionRegistry};
pub use sequence::{SequenceAllocator, VisibleSequence};
pub use types::{BatchOp, Entry, InternalKey, Key, SeqNum, SequenceRange, Value, ValueType, WriteBatch};
pub use wal::{RecoveryReport, SegmentMeta, SegmentReader, Wal, WalOptions, WalRecord, WalStats};
