/// Size at which the active WAL segment is sealed and a new one opened.
pub const DEFAULT_WAL_SEGMENT_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Sealed segments are kept at least this long. Zero disables the hold.
pub const DEFAULT_WAL_TTL_SECONDS: u64 = 0;

/// Approximate memtable size that triggers a switch and flush.
pub const DEFAULT_MEMTABLE_FLUSH_THRESHOLD_BYTES: usize = 4 * 1024 * 1024;

pub const DEFAULT_ARENA_BLOCK_SIZE: usize = 4096;

/// Idle time after which a change cursor loses its retention pin.
pub const DEFAULT_CURSOR_LEASE_TIMEOUT_SECS: u64 = 600;

pub const MAINTENANCE_INTERVAL_MS: u64 = 1000;

/// Digits in a WAL segment file name, e.g. `000042.log`.
pub const WAL_FILE_NUM_DIGITS: usize = 6;

pub const WAL_FILE_EXTENSION: &str = "log";

/// Rough per-entry cost of a skip list node beyond the key and value bytes.
pub const MEMTABLE_ENTRY_OVERHEAD: usize = 64;
