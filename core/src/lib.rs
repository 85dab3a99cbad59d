// Public API
pub mod error;
pub mod lsm;

// Internal modules
pub(crate) mod constants;
pub(crate) mod varint;

pub use error::{Error, Result};
pub use lsm::{
    BatchResult, ChangeIterator, CursorState, Db, DbConfig, DbStats, LookupResult, MemorySink, SeqNum,
    SequenceRange, WriteBatch,
};
