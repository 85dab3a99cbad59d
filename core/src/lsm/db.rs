//! Db - coordinator for the write path, memtable lifecycle and replication.
//!
//! Writes go to the WAL first, then to the active memtable. When the active
//! memtable grows past the flush threshold it is made immutable, a fresh one
//! takes its place, and the old one is handed to the [`FlushSink`]. Flushed
//! data lets the WAL purge move forward, held back by live change cursors.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::changes::ChangeIterator;
use super::flush::{FlushCompletion, FlushOutcome, FlushSink};
use super::memtable::{FlushState, FlushTicket, LookupResult, MemTable, MemTableOptions, MemTableRef};
use super::merge::MergeOperator;
use super::retention::RetentionRegistry;
use super::sequence::VisibleSequence;
use super::types::{Key, SeqNum, SequenceRange, Value, WriteBatch};
use super::wal::{Wal, WalOptions};
use crate::constants::{
    DEFAULT_ARENA_BLOCK_SIZE, DEFAULT_CURSOR_LEASE_TIMEOUT_SECS, DEFAULT_MEMTABLE_FLUSH_THRESHOLD_BYTES,
    DEFAULT_WAL_SEGMENT_SIZE_BYTES, DEFAULT_WAL_TTL_SECONDS, MAINTENANCE_INTERVAL_MS,
};
use crate::error::{Error, Result};

/// Configuration for the database.
#[derive(Clone, Debug)]
pub struct DbConfig {
    /// Directory for data files. The WAL lives in `<data_dir>/wal`.
    pub data_dir: PathBuf,
    /// Size at which the active WAL segment is sealed.
    pub wal_segment_size_bytes: u64,
    /// Minimum age of a sealed segment before deletion. Zero disables it.
    pub wal_ttl_seconds: u64,
    /// `sync_data` the WAL after every write.
    pub wal_sync: bool,
    /// Memtable size that triggers a switch and flush.
    pub memtable_flush_threshold_bytes: usize,
    pub arena_block_size: usize,
    /// Hard cap on one memtable's arena. Zero means unlimited.
    pub arena_limit_bytes: usize,
    /// Idle time after which a change cursor loses its pin. Zero disables it.
    pub cursor_lease_timeout_secs: u64,
    /// Period of the background flush/purge thread. Zero disables the thread.
    pub maintenance_interval_ms: u64,
    /// Every sequence up to this one is already persisted outside the WAL.
    pub persisted_sequence: SeqNum,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_segment_size_bytes: DEFAULT_WAL_SEGMENT_SIZE_BYTES,
            wal_ttl_seconds: DEFAULT_WAL_TTL_SECONDS,
            wal_sync: true,
            memtable_flush_threshold_bytes: DEFAULT_MEMTABLE_FLUSH_THRESHOLD_BYTES,
            arena_block_size: DEFAULT_ARENA_BLOCK_SIZE,
            arena_limit_bytes: 0,
            cursor_lease_timeout_secs: DEFAULT_CURSOR_LEASE_TIMEOUT_SECS,
            maintenance_interval_ms: MAINTENANCE_INTERVAL_MS,
            persisted_sequence: 0,
        }
    }
}

impl DbConfig {
    fn wal_options(&self) -> WalOptions {
        WalOptions {
            segment_size_bytes: self.wal_segment_size_bytes,
            ttl: Duration::from_secs(self.wal_ttl_seconds),
            sync: self.wal_sync,
        }
    }

    fn memtable_options(&self) -> MemTableOptions {
        MemTableOptions {
            arena_block_size: self.arena_block_size,
            arena_limit_bytes: self.arena_limit_bytes,
        }
    }
}

/// Statistics about the database.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub active_memtable_entries: usize,
    pub active_memtable_bytes: usize,
    pub immutable_memtables: usize,
    pub last_sequence: SeqNum,
    pub visible_sequence: SeqNum,
    pub flushed_through: SeqNum,
    pub wal_segments: usize,
    pub wal_bytes: u64,
    pub live_cursors: usize,
}

struct MemTables {
    active: MemTableRef,
    /// Waiting for or undergoing flush, oldest first.
    immutable: VecDeque<MemTableRef>,
}

struct DbInner {
    config: DbConfig,
    wal: Arc<Wal>,
    memtables: RwLock<MemTables>,
    visible: VisibleSequence,
    retention: Arc<RetentionRegistry>,
    sink: Arc<dyn FlushSink>,
    merge_operator: Option<Arc<dyn MergeOperator>>,
    next_memtable_id: AtomicU64,
    /// Largest sequence persisted by an installed flush.
    flushed_through: AtomicU64,
    poisoned: Mutex<Option<String>>,
    /// Serializes starting flushes.
    schedule_lock: Mutex<()>,
    /// Serializes installing finished flushes.
    install_lock: Mutex<()>,
    /// Finished flushes waiting for every older memtable to finish.
    completed: Mutex<HashMap<u64, (FlushTicket, FlushOutcome)>>,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

/// Database handle.
pub struct Db {
    inner: Arc<DbInner>,
    maintenance: Option<JoinHandle<()>>,
}

impl Db {
    /// Opens the database, replaying WAL batches newer than
    /// `config.persisted_sequence` into a fresh memtable.
    pub fn open(
        config: DbConfig,
        sink: Arc<dyn FlushSink>,
        merge_operator: Option<Arc<dyn MergeOperator>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let persisted = config.persisted_sequence;
        let wal = Arc::new(Wal::open(config.data_dir.join("wal"), config.wal_options(), persisted)?);

        let log_number = wal
            .segment_for(persisted + 1)
            .map_or_else(|| wal.active_file_number(), |m| m.file_number);
        let active = MemTable::create(1, log_number, &config.memtable_options(), merge_operator.clone());
        let recovered = Self::recover_memtable(&wal, &active, persisted)?;

        let last_sequence = wal.last_sequence();
        info!(
            data_dir = %config.data_dir.display(),
            recovered,
            last_sequence,
            persisted,
            "database opened"
        );

        let inner = Arc::new(DbInner {
            retention: RetentionRegistry::new(Duration::from_secs(config.cursor_lease_timeout_secs)),
            visible: VisibleSequence::new(last_sequence),
            flushed_through: AtomicU64::new(persisted),
            memtables: RwLock::new(MemTables {
                active,
                immutable: VecDeque::new(),
            }),
            next_memtable_id: AtomicU64::new(2),
            wal,
            sink,
            merge_operator,
            poisoned: Mutex::new(None),
            schedule_lock: Mutex::new(()),
            install_lock: Mutex::new(()),
            completed: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            config,
        });

        inner.maybe_switch()?;
        let maintenance = DbInner::spawn_maintenance(&inner);
        Ok(Self { inner, maintenance })
    }

    fn recover_memtable(wal: &Wal, active: &MemTableRef, persisted: SeqNum) -> Result<u64> {
        let mut recovered = 0;
        wal.replay(persisted + 1, |first, batch| {
            for (i, op) in batch.ops().iter().enumerate() {
                let seq = first + i as u64;
                if seq <= persisted {
                    continue;
                }
                active.add(seq, op.value_type, op.key.as_bytes(), op.value.as_bytes())?;
                recovered += 1;
            }
            Ok(())
        })?;
        Ok(recovered)
    }

    /// Put a key-value pair.
    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<SeqNum> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        Ok(self.write(&batch)?.first)
    }

    /// Delete a key.
    pub fn delete(&self, key: impl Into<Key>) -> Result<SeqNum> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        Ok(self.write(&batch)?.first)
    }

    /// Record a merge operand for a key.
    pub fn merge(&self, key: impl Into<Key>, operand: impl Into<Value>) -> Result<SeqNum> {
        let mut batch = WriteBatch::new();
        batch.merge(key, operand);
        Ok(self.write(&batch)?.first)
    }

    /// Logs and applies a batch; its operations get consecutive sequences.
    pub fn write(&self, batch: &WriteBatch) -> Result<SequenceRange> {
        self.inner.write(batch)
    }

    /// Looks up `key` at the latest visible sequence.
    pub fn get(&self, key: &[u8]) -> Result<LookupResult> {
        self.inner.get_at(key, self.snapshot())
    }

    /// Looks up `key` as of `snapshot`.
    pub fn get_at(&self, key: &[u8], snapshot: SeqNum) -> Result<LookupResult> {
        self.inner.get_at(key, snapshot)
    }

    /// Highest sequence whose write, and every earlier one, is readable.
    pub fn snapshot(&self) -> SeqNum {
        self.inner.visible.get()
    }

    /// Opens a replication cursor at `start`. Fails with
    /// `HistoryUnavailable` if the log no longer reaches back that far.
    pub fn open_change_stream(&self, start: SeqNum) -> Result<ChangeIterator> {
        self.inner.open_change_stream(start)
    }

    /// Makes the active memtable immutable and starts flushing every
    /// memtable that is waiting for it.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_poisoned()?;
        self.inner.switch_memtable(true)?;
        self.inner.schedule_flushes()
    }

    /// Retries flushes that failed earlier.
    pub fn retry_flushes(&self) -> Result<()> {
        self.inner.schedule_flushes()
    }

    /// Evicts idle cursors and deletes WAL segments that are below the
    /// retention floor and past their TTL.
    pub fn purge_obsolete_wal(&self) -> Result<Vec<u64>> {
        self.inner.purge_obsolete_wal()
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.inner.wal
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    /// Largest sequence persisted by an installed flush.
    pub fn flushed_through(&self) -> SeqNum {
        self.inner.flushed_through.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DbStats {
        self.inner.stats()
    }

    /// Stops background maintenance and syncs the WAL.
    pub fn close(mut self) -> Result<()> {
        self.stop_maintenance();
        self.inner.wal.sync()
    }

    fn stop_maintenance(&mut self) {
        *self.inner.shutdown.lock() = true;
        self.inner.shutdown_cv.notify_all();
        self.inner.wal.notify_appended();
        if let Some(handle) = self.maintenance.take() {
            if handle.join().is_err() {
                error!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

impl DbInner {
    fn write(self: &Arc<Self>, batch: &WriteBatch) -> Result<SequenceRange> {
        self.check_poisoned()?;

        let range = {
            let memtables = self.memtables.read();
            let range = self.wal.append(batch).inspect_err(|e| self.poison_if_fatal(e))?;
            for (i, op) in batch.ops().iter().enumerate() {
                memtables
                    .active
                    .add(range.first + i as u64, op.value_type, op.key.as_bytes(), op.value.as_bytes())
                    .inspect_err(|e| self.poison(e))?;
            }
            range
        };

        self.visible.publish(range);
        self.maybe_switch()?;
        Ok(range)
    }

    fn get_at(&self, key: &[u8], snapshot: SeqNum) -> Result<LookupResult> {
        // Newest first. The cloned references keep each table alive even if
        // its flush is installed while we read.
        let tables: Vec<MemTableRef> = {
            let memtables = self.memtables.read();
            std::iter::once(&memtables.active)
                .chain(memtables.immutable.iter().rev())
                .cloned()
                .collect()
        };

        let mut operands = VecDeque::new();
        for table in &tables {
            if let Some(result) = table.get_into(key, snapshot, &mut operands)? {
                return Ok(result);
            }
        }
        Ok(if operands.is_empty() {
            LookupResult::Absent
        } else {
            LookupResult::MergeInProgress(operands.into())
        })
    }

    fn open_change_stream(&self, start: SeqNum) -> Result<ChangeIterator> {
        let start = start.max(1);
        let wal = Arc::clone(&self.wal);
        let lease = self.retention.acquire(start, || {
            let oldest = wal.earliest_available_sequence();
            if start < oldest {
                return Err(Error::HistoryUnavailable {
                    requested: start,
                    oldest,
                });
            }
            Ok(())
        })?;
        ChangeIterator::new(wal, lease, start)
    }

    fn maybe_switch(self: &Arc<Self>) -> Result<()> {
        let full = self.memtables.read().active.approximate_memory_usage() >= self.config.memtable_flush_threshold_bytes;
        if full && self.switch_memtable(false)? {
            self.schedule_flushes()?;
        }
        Ok(())
    }

    /// Replaces the active memtable. Without `force` only a full table is
    /// replaced; an empty one never is.
    fn switch_memtable(&self, force: bool) -> Result<bool> {
        let mut memtables = self.memtables.write();
        let usage = memtables.active.approximate_memory_usage();
        if memtables.active.is_empty() || (!force && usage < self.config.memtable_flush_threshold_bytes) {
            return Ok(false);
        }

        memtables.active.request_flush().inspect_err(|e| self.poison(e))?;
        let id = self.next_memtable_id.fetch_add(1, Ordering::Relaxed);
        let fresh = MemTable::create(
            id,
            self.wal.active_file_number(),
            &self.config.memtable_options(),
            self.merge_operator.clone(),
        );
        let old = std::mem::replace(&mut memtables.active, fresh);
        info!(
            memtable_id = old.id(),
            entries = old.len(),
            bytes = usage,
            next = id,
            "memtable switched"
        );
        memtables.immutable.push_back(old);
        Ok(true)
    }

    /// Hands every flush-requested memtable to the sink, oldest first.
    fn schedule_flushes(self: &Arc<Self>) -> Result<()> {
        let _schedule = self.schedule_lock.lock();
        let pending: Vec<MemTableRef> = self
            .memtables
            .read()
            .immutable
            .iter()
            .filter(|m| m.flush_state() == FlushState::FlushRequested)
            .cloned()
            .collect();

        for table in pending {
            let job = table.begin_flush().inspect_err(|e| self.poison(e))?;
            let memtable_id = job.metadata.memtable_id;
            debug!(
                memtable_id,
                entries = job.metadata.entry_count,
                largest_sequence = job.metadata.largest_sequence,
                "flush scheduled"
            );

            let weak: Weak<DbInner> = Arc::downgrade(self);
            let ticket = job.ticket;
            let completion = FlushCompletion::new(memtable_id, move |result| match weak.upgrade() {
                Some(inner) => inner.flush_finished(ticket, result),
                None => debug!(memtable_id, "flush finished after close"),
            });
            self.sink.write_table(job.metadata, job.entries, completion);
        }
        Ok(())
    }

    fn flush_finished(&self, ticket: FlushTicket, result: Result<FlushOutcome>) {
        let memtable_id = ticket.memtable_id();
        match result {
            Ok(outcome) => {
                self.completed.lock().insert(memtable_id, (ticket, outcome));
                if let Err(e) = self.install_completed() {
                    self.poison(&e);
                }
            }
            Err(e) => {
                warn!(memtable_id, error = %e, "flush failed, will retry");
                if let Err(e) = ticket.abort() {
                    self.poison(&e);
                }
            }
        }
    }

    /// Installs finished flushes in memtable order. A flush that finished
    /// early waits for every older one.
    fn install_completed(&self) -> Result<()> {
        let _install = self.install_lock.lock();
        loop {
            let front_id = match self.memtables.read().immutable.front() {
                Some(table) => table.id(),
                None => return Ok(()),
            };
            let Some((ticket, outcome)) = self.completed.lock().remove(&front_id) else {
                return Ok(());
            };

            ticket.complete(&outcome)?;
            let installed = self.memtables.write().immutable.pop_front();
            self.flushed_through
                .fetch_max(outcome.largest_sequence, Ordering::AcqRel);
            info!(
                memtable_id = front_id,
                file_number = outcome.file_number,
                largest_sequence = outcome.largest_sequence,
                "flush installed"
            );
            drop(installed);
        }
    }

    fn purge_obsolete_wal(&self) -> Result<Vec<u64>> {
        let _gate = self.retention.lock_gate();
        self.retention.expire_idle(Instant::now());

        let flushed = self.flushed_through.load(Ordering::Acquire);
        let floor = match self.retention.min_pinned() {
            Some(pinned) => pinned.min(flushed + 1),
            None => flushed + 1,
        };
        let deleted = self.wal.purge(floor, SystemTime::now())?;
        if !deleted.is_empty() {
            debug!(floor, deleted = deleted.len(), "obsolete WAL segments purged");
        }
        Ok(deleted)
    }

    fn stats(&self) -> DbStats {
        let memtables = self.memtables.read();
        let wal = self.wal.stats();
        DbStats {
            active_memtable_entries: memtables.active.len(),
            active_memtable_bytes: memtables.active.approximate_memory_usage(),
            immutable_memtables: memtables.immutable.len(),
            last_sequence: wal.last_sequence,
            visible_sequence: self.visible.get(),
            flushed_through: self.flushed_through.load(Ordering::Acquire),
            wal_segments: wal.segment_count,
            wal_bytes: wal.total_bytes,
            live_cursors: self.retention.live_count(),
        }
    }

    fn check_poisoned(&self) -> Result<()> {
        match self.poisoned.lock().as_ref() {
            Some(reason) => Err(Error::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    fn poison(&self, err: &Error) {
        let mut poisoned = self.poisoned.lock();
        if poisoned.is_none() {
            error!(error = %err, "write path poisoned");
            *poisoned = Some(err.to_string());
        }
    }

    fn poison_if_fatal(&self, err: &Error) {
        if err.is_fatal() {
            self.poison(err);
        }
    }

    fn spawn_maintenance(inner: &Arc<Self>) -> Option<JoinHandle<()>> {
        if inner.config.maintenance_interval_ms == 0 {
            return None;
        }
        let interval = Duration::from_millis(inner.config.maintenance_interval_ms);
        let inner = Arc::clone(inner);
        Some(std::thread::spawn(move || {
            loop {
                {
                    let mut stopped = inner.shutdown.lock();
                    if !*stopped {
                        inner.shutdown_cv.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                inner.run_maintenance();
            }
            debug!("maintenance thread stopped");
        }))
    }

    fn run_maintenance(self: &Arc<Self>) {
        if self.check_poisoned().is_ok() {
            if let Err(e) = self.schedule_flushes() {
                error!(error = %e, "background flush failed");
            }
        }
        if let Err(e) = self.purge_obsolete_wal() {
            warn!(error = %e, "WAL purge failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsm::flush::MemorySink;
    use crate::lsm::merge::DecimalAddOperator;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> DbConfig {
        DbConfig {
            data_dir: dir.path().to_path_buf(),
            maintenance_interval_ms: 0,
            ..Default::default()
        }
    }

    fn open(config: DbConfig) -> (Db, Arc<MemorySink>) {
        let sink = MemorySink::new();
        let db = Db::open(config, sink.clone(), Some(Arc::new(DecimalAddOperator))).unwrap();
        (db, sink)
    }

    fn found(value: &str) -> LookupResult {
        LookupResult::Found(Value::from(value))
    }

    #[test]
    fn test_basic_put_get() {
        let dir = TempDir::new().unwrap();
        let (db, _) = open(test_config(&dir));

        assert_eq!(db.put("key1", "value1").unwrap(), 1);
        assert_eq!(db.put("key2", "value2").unwrap(), 2);

        assert_eq!(db.get(b"key1").unwrap(), found("value1"));
        assert_eq!(db.get(b"key2").unwrap(), found("value2"));
        assert_eq!(db.get(b"key3").unwrap(), LookupResult::Absent);
        assert_eq!(db.snapshot(), 2);
    }

    #[test]
    fn test_overwrite_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let (db, _) = open(test_config(&dir));

        let first = db.put("key", "v1").unwrap();
        db.put("key", "v2").unwrap();

        assert_eq!(db.get(b"key").unwrap(), found("v2"));
        assert_eq!(db.get_at(b"key", first).unwrap(), found("v1"));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let (db, _) = open(test_config(&dir));

        db.put("key", "value").unwrap();
        db.delete("key").unwrap();
        assert_eq!(db.get(b"key").unwrap(), LookupResult::NotFound);
    }

    #[test]
    fn test_batch_gets_consecutive_sequences() {
        let dir = TempDir::new().unwrap();
        let (db, _) = open(test_config(&dir));

        db.put("a", "0").unwrap();
        let mut batch = WriteBatch::new();
        batch.put("a", "1").merge("a", "+2").delete("b");
        let range = db.write(&batch).unwrap();
        assert_eq!(range, SequenceRange { first: 2, last: 4 });
        assert_eq!(db.get(b"a").unwrap(), found("3"));
    }

    #[test]
    fn test_flush_hands_memtable_to_sink() {
        let dir = TempDir::new().unwrap();
        let (db, sink) = open(test_config(&dir));

        db.put("key1", "value1").unwrap();
        db.put("key2", "value2").unwrap();
        db.flush().unwrap();

        let tables = sink.tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].entries.len(), 2);
        assert_eq!(tables[0].metadata.largest_sequence, Some(2));
        assert_eq!(db.flushed_through(), 2);

        let stats = db.stats();
        assert_eq!(stats.immutable_memtables, 0);
        assert_eq!(stats.active_memtable_entries, 0);

        // Flushing an empty memtable does nothing.
        db.flush().unwrap();
        assert_eq!(sink.table_count(), 1);
    }

    #[test]
    fn test_threshold_triggers_switch() {
        let dir = TempDir::new().unwrap();
        let config = DbConfig {
            memtable_flush_threshold_bytes: 8 * 1024,
            ..test_config(&dir)
        };
        let (db, sink) = open(config);

        for i in 0..100 {
            db.put(format!("key{i:03}").as_str(), vec![b'x'; 200]).unwrap();
        }
        assert!(sink.table_count() > 1);

        let flushed: usize = sink.tables().iter().map(|t| t.entries.len()).sum();
        assert_eq!(flushed + db.stats().active_memtable_entries, 100);
        assert!(db.flushed_through() > 0);
    }

    #[test]
    fn test_failed_flush_is_retried() {
        let dir = TempDir::new().unwrap();
        let (db, sink) = open(test_config(&dir));

        db.put("a", "1").unwrap();
        sink.set_failing(true);
        db.flush().unwrap();
        assert_eq!(db.flushed_through(), 0);
        assert_eq!(db.stats().immutable_memtables, 1);
        // The unflushed table still serves reads.
        assert_eq!(db.get(b"a").unwrap(), found("1"));

        sink.set_failing(false);
        db.retry_flushes().unwrap();
        assert_eq!(db.flushed_through(), 1);
        assert_eq!(db.stats().immutable_memtables, 0);
    }

    #[test]
    fn test_wal_is_synced_by_default() {
        let config = DbConfig::default();
        assert!(config.wal_sync);
        assert!(config.wal_options().sync);
        assert!(WalOptions::default().sync);
    }

    #[test]
    fn test_merge_operands_fold_across_memtables() {
        let dir = TempDir::new().unwrap();
        let (db, sink) = open(test_config(&dir));

        db.put("counter", "10").unwrap();
        sink.set_failing(true);
        db.flush().unwrap();
        db.merge("counter", "+1").unwrap();
        db.merge("counter", "+2").unwrap();

        assert_eq!(db.stats().immutable_memtables, 1);
        assert_eq!(db.get(b"counter").unwrap(), found("13"));
    }

    #[test]
    fn test_merge_without_base_stays_in_progress() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let db = Db::open(test_config(&dir), sink, None).unwrap();

        db.merge("a", "+1").unwrap();
        db.merge("a", "+2").unwrap();
        assert_eq!(
            db.get(b"a").unwrap(),
            LookupResult::MergeInProgress(vec![b"+1".to_vec(), b"+2".to_vec()])
        );
    }

    #[test]
    fn test_recovery_replays_unpersisted_writes() {
        let dir = TempDir::new().unwrap();
        {
            let (db, _) = open(test_config(&dir));
            db.put("key1", "value1").unwrap();
            db.put("key2", "value2").unwrap();
            db.delete("key1").unwrap();
            db.close().unwrap();
        }

        let (db, _) = open(test_config(&dir));
        assert_eq!(db.get(b"key1").unwrap(), LookupResult::NotFound);
        assert_eq!(db.get(b"key2").unwrap(), found("value2"));
        assert_eq!(db.put("key3", "value3").unwrap(), 4);
        drop(db);

        let config = DbConfig {
            persisted_sequence: 2,
            ..test_config(&dir)
        };
        let (db, _) = open(config);
        assert_eq!(db.get(b"key2").unwrap(), LookupResult::Absent);
        assert_eq!(db.get(b"key3").unwrap(), found("value3"));
        assert_eq!(db.put("key4", "value4").unwrap(), 5);
    }

    #[test]
    fn test_purge_waits_for_flush() {
        let dir = TempDir::new().unwrap();
        let config = DbConfig {
            wal_segment_size_bytes: 256,
            ..test_config(&dir)
        };
        let (db, _) = open(config);
        for i in 0..40 {
            db.put(format!("key{i}").as_str(), "value").unwrap();
        }
        let segments = db.wal().segments().len();
        assert!(segments > 2);

        assert!(db.purge_obsolete_wal().unwrap().is_empty());

        db.flush().unwrap();
        let deleted = db.purge_obsolete_wal().unwrap();
        assert!(!deleted.is_empty());
        assert_eq!(db.wal().earliest_available_sequence(), db.wal().segments()[0].min_seq.unwrap_or(41));
    }

    #[test]
    fn test_maintenance_thread_stops_on_close() {
        let dir = TempDir::new().unwrap();
        let config = DbConfig {
            maintenance_interval_ms: 10,
            ..test_config(&dir)
        };
        let (db, _) = open(config);
        db.put("a", "1").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        db.close().unwrap();
    }
}
