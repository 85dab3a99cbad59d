//! Error type shared by every storage component.
//!
//! Errors fall into three groups:
//! - consistency violations, which are fatal and poison the write path
//!   (see [`Error::is_fatal`]);
//! - data loss on the replication surface, reported to the consumer so it can
//!   resnapshot or refresh;
//! - ordinary IO and argument errors.

use thiserror::Error;

use crate::lsm::{FlushState, SeqNum};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL segment {file_number} corrupted at offset {offset}: {reason}")]
    Corruption {
        file_number: u64,
        offset: u64,
        reason: String,
    },

    #[error("sequence discontinuity: expected {expected}, found {found}")]
    SequenceGap { expected: SeqNum, found: SeqNum },

    #[error("sequence number space exhausted")]
    SequenceOverflow,

    #[error("sequence {requested} predates the oldest retained sequence {oldest}")]
    HistoryUnavailable { requested: SeqNum, oldest: SeqNum },

    #[error("change cursor {cursor_id} expired after inactivity; resume from {resume_from}")]
    CursorExpired { cursor_id: u64, resume_from: SeqNum },

    #[error("change cursor is invalid and must be reopened")]
    CursorInvalid,

    #[error("arena exhausted: limit of {limit} bytes reached")]
    ArenaExhausted { limit: usize },

    #[error("memtable {memtable_id} cannot move from {from:?} to {to:?}")]
    InvalidFlushTransition {
        memtable_id: u64,
        from: FlushState,
        to: FlushState,
    },

    #[error("memtable {memtable_id} no longer accepts writes")]
    ImmutableMemTable { memtable_id: u64 },

    #[error("merge operands found but no merge operator is registered")]
    MergeOperatorMissing,

    #[error("merge operator {operator} failed: {reason}")]
    Merge { operator: String, reason: String },

    #[error("flush failed: {0}")]
    Flush(String),

    #[error("write path poisoned by an earlier failure: {0}")]
    Poisoned(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Consistency violations. Continuing after one of these would break the
    /// ordering or durability guarantee, so they are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corruption { .. }
                | Error::SequenceGap { .. }
                | Error::SequenceOverflow
                | Error::ArenaExhausted { .. }
                | Error::InvalidFlushTransition { .. }
                | Error::ImmutableMemTable { .. }
        )
    }

    /// Errors that mean replication history is gone for this cursor.
    pub fn is_data_loss(&self) -> bool {
        matches!(
            self,
            Error::HistoryUnavailable { .. } | Error::CursorExpired { .. }
        )
    }
}
