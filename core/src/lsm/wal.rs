//! Segmented write-ahead log.
//!
//! Every write batch is appended to the active segment as one checksummed
//! record before it reaches the memtable. Segments are sealed when they grow
//! past the configured size, and sealed segments are deleted once both the
//! TTL and the retention floor allow it.
//!
//! Record layout (little endian):
//!
//! ```text
//! crc32 (4) | payload_len (4) | payload
//! payload = first_seq (8) | count (4) | count x op
//! op      = value_type (1) | key_len (varint) | key | value_len (varint) | value
//! ```
//!
//! The checksum covers `payload_len` and `payload`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::sequence::SequenceAllocator;
use super::types::{SeqNum, SequenceRange, WriteBatch};
use crate::constants::{
    DEFAULT_WAL_SEGMENT_SIZE_BYTES, DEFAULT_WAL_TTL_SECONDS, WAL_FILE_EXTENSION, WAL_FILE_NUM_DIGITS,
};
use crate::error::{Error, Result};

const RECORD_HEADER_LEN: u64 = 8;
const PAYLOAD_HEADER_LEN: usize = 12;

#[derive(Clone, Debug)]
pub struct WalOptions {
    pub segment_size_bytes: u64,
    /// Minimum age of a sealed segment before it may be deleted. Zero
    /// disables the hold.
    pub ttl: Duration,
    /// `sync_data` after every append.
    pub sync: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size_bytes: DEFAULT_WAL_SEGMENT_SIZE_BYTES,
            ttl: Duration::from_secs(DEFAULT_WAL_TTL_SECONDS),
            sync: true,
        }
    }
}

/// Bookkeeping for one segment file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentMeta {
    pub file_number: u64,
    pub min_seq: Option<SeqNum>,
    pub max_seq: Option<SeqNum>,
    /// Durable bytes. Readers never look past this offset.
    pub size: u64,
    pub created_at: SystemTime,
    /// `None` for the active segment.
    pub sealed_at: Option<SystemTime>,
}

impl SegmentMeta {
    fn new(file_number: u64, created_at: SystemTime) -> Self {
        Self {
            file_number,
            min_seq: None,
            max_seq: None,
            size: 0,
            created_at,
            sealed_at: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.max_seq.is_none()
    }

    fn record(&mut self, range: SequenceRange) {
        self.min_seq.get_or_insert(range.first);
        self.max_seq = Some(range.last);
    }
}

/// A decoded log record.
#[derive(Clone, Debug)]
pub struct WalRecord {
    pub first_sequence: SeqNum,
    pub batch: WriteBatch,
    /// Bytes the record occupies in the segment.
    pub encoded_len: u64,
}

impl WalRecord {
    pub fn range(&self) -> SequenceRange {
        SequenceRange {
            first: self.first_sequence,
            last: self.first_sequence + self.batch.len() as u64 - 1,
        }
    }
}

pub(crate) fn encode_record(first_sequence: SeqNum, batch: &WriteBatch) -> Vec<u8> {
    let payload_len = PAYLOAD_HEADER_LEN + batch.encoded_len();
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + payload_len);
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
    buf.extend_from_slice(&first_sequence.to_le_bytes());
    buf.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    batch.encode_ops(&mut buf);

    let crc = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&crc.to_le_bytes());
    buf
}

pub(crate) fn segment_path(dir: &Path, file_number: u64) -> PathBuf {
    dir.join(format!(
        "{:0width$}.{}",
        file_number,
        WAL_FILE_EXTENSION,
        width = WAL_FILE_NUM_DIGITS
    ))
}

fn parse_segment_name(path: &Path) -> Option<u64> {
    if path.extension()? != WAL_FILE_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(dir)? {
        if let Some(number) = parse_segment_name(&entry?.path()) {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Sequential reader over the records of one segment.
pub struct SegmentReader {
    file_number: u64,
    reader: BufReader<File>,
    offset: u64,
}

impl SegmentReader {
    pub fn open(dir: &Path, file_number: u64, offset: u64) -> Result<Self> {
        let mut file = File::open(segment_path(dir, file_number))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            file_number,
            reader: BufReader::new(file),
            offset,
        })
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the next record that ends at or before `limit`.
    ///
    /// Returns `None` when the reader sits exactly at `limit`. Anything
    /// else that is not a whole valid record is `Corruption`.
    pub fn read_next(&mut self, limit: u64) -> Result<Option<WalRecord>> {
        if self.offset >= limit {
            return Ok(None);
        }
        if self.offset + RECORD_HEADER_LEN > limit {
            return Err(self.corruption("truncated record header"));
        }

        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        self.read_exact(&mut header)?;
        let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;

        if (payload_len as usize) < PAYLOAD_HEADER_LEN {
            return Err(self.corruption("payload shorter than its header"));
        }
        if self.offset + RECORD_HEADER_LEN + payload_len > limit {
            return Err(self.corruption("record extends past the end of the segment"));
        }

        let mut payload = vec![0u8; payload_len as usize];
        self.read_exact(&mut payload)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[4..]);
        hasher.update(&payload);
        if hasher.finalize() != crc {
            return Err(self.corruption("checksum mismatch"));
        }

        let mut first = [0u8; 8];
        first.copy_from_slice(&payload[..8]);
        let first_sequence = u64::from_le_bytes(first);
        let count = u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]) as usize;
        if count == 0 || first_sequence == 0 {
            return Err(self.corruption("empty batch or zero sequence"));
        }

        let batch = WriteBatch::decode_ops(&payload[PAYLOAD_HEADER_LEN..], count)
            .map_err(|e| self.corruption(&e.to_string()))?;

        let encoded_len = RECORD_HEADER_LEN + payload_len;
        self.offset += encoded_len;
        Ok(Some(WalRecord {
            first_sequence,
            batch,
            encoded_len,
        }))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => self.corruption("unexpected end of file"),
            _ => Error::Io(e),
        })
    }

    fn corruption(&self, reason: &str) -> Error {
        Error::Corruption {
            file_number: self.file_number,
            offset: self.offset,
            reason: reason.to_string(),
        }
    }
}

struct WalWriter {
    file: BufWriter<File>,
    file_number: u64,
    size: u64,
    poisoned: Option<String>,
}

impl WalWriter {
    fn create(dir: &Path, file_number: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(segment_path(dir, file_number))?;
        Ok(Self {
            file: BufWriter::new(file),
            file_number,
            size: 0,
            poisoned: None,
        })
    }

    fn write_record(&mut self, record: &[u8], sync: bool) -> Result<()> {
        self.file.write_all(record)?;
        self.file.flush()?;
        if sync {
            self.file.get_ref().sync_data()?;
        }
        self.size += record.len() as u64;
        Ok(())
    }

    fn check_poisoned(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(Error::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }
}

/// What recovery found in the directory.
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    pub segments: usize,
    pub records: u64,
    pub last_sequence: Option<SeqNum>,
    /// Bytes cut from a torn tail of the newest segment.
    pub truncated_bytes: u64,
    /// Segments deleted because every sequence in them was already persisted
    /// and the log ended below the persisted sequence.
    pub retired_segments: usize,
}

#[derive(Clone, Debug, Default)]
pub struct WalStats {
    pub segment_count: usize,
    pub total_bytes: u64,
    pub active_file_number: u64,
    pub last_sequence: SeqNum,
}

pub struct Wal {
    dir: PathBuf,
    options: WalOptions,
    sequences: SequenceAllocator,
    writer: Mutex<WalWriter>,
    /// Ordered by file number; the last one is active.
    segments: RwLock<Vec<SegmentMeta>>,
    /// Last sequence durably appended.
    last_sequence: AtomicU64,
    recovery: RecoveryReport,
    appended: Mutex<()>,
    appended_cv: Condvar,
}

impl Wal {
    /// Opens the log in `dir`, scanning every existing segment, and starts a
    /// fresh active segment. Sequences resume after the larger of the last
    /// logged sequence and `persisted_sequence`.
    pub fn open(dir: impl AsRef<Path>, options: WalOptions, persisted_sequence: SeqNum) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let numbers = list_segments(&dir)?;
        let mut report = RecoveryReport::default();
        let mut segments = Vec::with_capacity(numbers.len() + 1);
        for (i, &number) in numbers.iter().enumerate() {
            let newest = i + 1 == numbers.len();
            segments.push(recover_segment(&dir, number, newest, &mut report)?);
        }
        report.segments = segments.len();

        // The log lost its tail after those sequences reached the table
        // store. Appending at `persisted_sequence + 1` would leave a hole the
        // next recovery rejects, so the whole retained log is retired.
        if report.last_sequence.is_some_and(|last| last < persisted_sequence) {
            warn!(
                dir = %dir.display(),
                last_logged = report.last_sequence,
                persisted_sequence,
                segments = segments.len(),
                "WAL ends below the persisted sequence, retiring retained segments"
            );
            for meta in segments.drain(..) {
                fs::remove_file(segment_path(&dir, meta.file_number))?;
            }
            report.retired_segments = report.segments;
        }

        let last_sequence = report.last_sequence.unwrap_or(0).max(persisted_sequence);
        let active_number = numbers.last().map_or(1, |n| n + 1);
        let writer = WalWriter::create(&dir, active_number)?;
        segments.push(SegmentMeta::new(active_number, SystemTime::now()));

        info!(
            dir = %dir.display(),
            segments = report.segments,
            records = report.records,
            last_sequence,
            active = active_number,
            "WAL opened"
        );

        Ok(Self {
            dir,
            options,
            sequences: SequenceAllocator::resume_after(last_sequence),
            writer: Mutex::new(writer),
            segments: RwLock::new(segments),
            last_sequence: AtomicU64::new(last_sequence),
            recovery: report,
            appended: Mutex::new(()),
            appended_cv: Condvar::new(),
        })
    }

    /// Assigns sequences to `batch` and appends it as one record.
    ///
    /// Sequences are allocated under the writer lock, so record order on
    /// disk is sequence order. A failed write or sync poisons the log.
    pub fn append(&self, batch: &WriteBatch) -> Result<SequenceRange> {
        if batch.is_empty() {
            return Err(Error::InvalidArgument("empty write batch".into()));
        }

        let mut writer = self.writer.lock();
        writer.check_poisoned()?;

        let range = self.sequences.next_range(batch.len() as u64)?;
        let record = encode_record(range.first, batch);
        if let Err(e) = writer.write_record(&record, self.options.sync) {
            error!(file_number = writer.file_number, first = range.first, error = %e, "WAL append failed, log poisoned");
            writer.poisoned = Some(e.to_string());
            return Err(e);
        }

        {
            let mut segments = self.segments.write();
            if let Some(active) = segments.last_mut() {
                active.record(range);
                active.size = writer.size;
            }
        }
        self.last_sequence.store(range.last, Ordering::Release);

        if writer.size >= self.options.segment_size_bytes {
            if let Err(e) = self.rotate_locked(&mut writer) {
                warn!(file_number = writer.file_number, error = %e, "WAL rotation failed, staying on current segment");
            }
        }
        drop(writer);

        self.notify_appended();
        Ok(range)
    }

    /// Seals the active segment and opens the next one. No-op while the
    /// active segment is empty.
    pub fn rotate(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.check_poisoned()?;
        self.rotate_locked(&mut writer)
    }

    fn rotate_locked(&self, writer: &mut WalWriter) -> Result<()> {
        if writer.size == 0 {
            return Ok(());
        }
        writer.file.flush()?;
        writer.file.get_ref().sync_data()?;

        let next = WalWriter::create(&self.dir, writer.file_number + 1)?;
        let now = SystemTime::now();
        {
            let mut segments = self.segments.write();
            if let Some(active) = segments.last_mut() {
                active.sealed_at = Some(now);
            }
            segments.push(SegmentMeta::new(next.file_number, now));
        }

        info!(sealed = writer.file_number, size = writer.size, active = next.file_number, "WAL segment rotated");
        *writer = next;
        Ok(())
    }

    /// Flushes and syncs the active segment.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.check_poisoned()?;
        writer.file.flush()?;
        writer.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Deletes sealed segments, oldest first, whose every sequence is below
    /// `floor` and whose TTL has run out at `now`. Stops at the first segment
    /// that must stay. Returns the deleted file numbers.
    pub fn purge(&self, floor: SeqNum, now: SystemTime) -> Result<Vec<u64>> {
        let victims: Vec<SegmentMeta> = {
            let segments = self.segments.read();
            let sealed = segments.len().saturating_sub(1);
            segments[..sealed]
                .iter()
                .take_while(|meta| self.is_expired(meta, floor, now))
                .cloned()
                .collect()
        };

        let mut deleted = Vec::with_capacity(victims.len());
        for meta in victims {
            {
                let mut segments = self.segments.write();
                if segments.first().map(|s| s.file_number) != Some(meta.file_number) {
                    break;
                }
                segments.remove(0);
            }
            match fs::remove_file(segment_path(&self.dir, meta.file_number)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!(
                file_number = meta.file_number,
                max_seq = meta.max_seq,
                floor,
                "WAL segment deleted"
            );
            deleted.push(meta.file_number);
        }
        Ok(deleted)
    }

    fn is_expired(&self, meta: &SegmentMeta, floor: SeqNum, now: SystemTime) -> bool {
        let Some(sealed_at) = meta.sealed_at else {
            return false;
        };
        if meta.max_seq.is_some_and(|max| max >= floor) {
            return false;
        }
        if meta.is_empty() || self.options.ttl.is_zero() {
            return true;
        }
        now.duration_since(sealed_at).is_ok_and(|age| age >= self.options.ttl)
    }

    /// Streams every retained batch that holds a sequence `>= from`, in
    /// order. The callback gets the batch's first sequence.
    pub fn replay<F>(&self, from: SeqNum, mut f: F) -> Result<u64>
    where
        F: FnMut(SeqNum, &WriteBatch) -> Result<()>,
    {
        let segments = self.segments();
        let mut replayed = 0;
        for meta in segments.iter().filter(|m| m.max_seq.is_some_and(|max| max >= from)) {
            let mut reader = SegmentReader::open(&self.dir, meta.file_number, 0)?;
            while let Some(record) = reader.read_next(meta.size)? {
                if record.range().last < from {
                    continue;
                }
                f(record.first_sequence, &record.batch)?;
                replayed += 1;
            }
        }
        debug!(from, replayed, "WAL replayed");
        Ok(replayed)
    }

    /// Oldest sequence still readable, or the next sequence to be assigned
    /// when no segment holds data.
    pub fn earliest_available_sequence(&self) -> SeqNum {
        self.segments
            .read()
            .iter()
            .find_map(|m| m.min_seq)
            .unwrap_or_else(|| self.last_sequence() + 1)
    }

    pub fn last_sequence(&self) -> SeqNum {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn segments(&self) -> Vec<SegmentMeta> {
        self.segments.read().clone()
    }

    pub fn segment_meta(&self, file_number: u64) -> Option<SegmentMeta> {
        self.segments
            .read()
            .iter()
            .find(|m| m.file_number == file_number)
            .cloned()
    }

    /// The segment following `file_number`.
    pub fn next_segment(&self, file_number: u64) -> Option<SegmentMeta> {
        self.segments
            .read()
            .iter()
            .find(|m| m.file_number > file_number)
            .cloned()
    }

    /// First segment that may hold `seq`: the oldest one whose `max_seq` is
    /// at least `seq`, else the active segment.
    pub fn segment_for(&self, seq: SeqNum) -> Option<SegmentMeta> {
        let segments = self.segments.read();
        segments
            .iter()
            .find(|m| m.max_seq.is_some_and(|max| max >= seq))
            .or_else(|| segments.last())
            .cloned()
    }

    pub fn active_file_number(&self) -> u64 {
        self.writer.lock().file_number
    }

    pub fn open_reader(&self, file_number: u64, offset: u64) -> Result<SegmentReader> {
        SegmentReader::open(&self.dir, file_number, offset)
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn is_poisoned(&self) -> bool {
        self.writer.lock().poisoned.is_some()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> WalStats {
        let active_file_number = self.active_file_number();
        let segments = self.segments.read();
        WalStats {
            segment_count: segments.len(),
            total_bytes: segments.iter().map(|m| m.size).sum(),
            active_file_number,
            last_sequence: self.last_sequence(),
        }
    }

    /// Blocks until `seq` has been appended or `timeout` passes. Returns
    /// whether the sequence is available.
    pub fn wait_for_sequence(&self, seq: SeqNum, timeout: Duration) -> bool {
        if self.last_sequence() >= seq {
            return true;
        }
        let mut guard = self.appended.lock();
        if self.last_sequence() >= seq {
            return true;
        }
        self.appended_cv.wait_for(&mut guard, timeout);
        self.last_sequence() >= seq
    }

    /// Wakes every waiter without new data, e.g. on shutdown.
    pub fn notify_appended(&self) {
        let _guard = self.appended.lock();
        self.appended_cv.notify_all();
    }
}

fn recover_segment(dir: &Path, file_number: u64, newest: bool, report: &mut RecoveryReport) -> Result<SegmentMeta> {
    let path = segment_path(dir, file_number);
    let metadata = fs::metadata(&path)?;
    let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
    let file_len = metadata.len();

    let mut meta = SegmentMeta::new(file_number, metadata.created().unwrap_or(modified));
    meta.sealed_at = Some(modified);

    let mut reader = SegmentReader::open(dir, file_number, 0)?;
    loop {
        match reader.read_next(file_len) {
            Ok(Some(record)) => {
                let range = record.range();
                if let Some(last) = report.last_sequence {
                    if range.first != last + 1 {
                        return Err(Error::SequenceGap {
                            expected: last + 1,
                            found: range.first,
                        });
                    }
                }
                meta.record(range);
                report.last_sequence = Some(range.last);
                report.records += 1;
            }
            Ok(None) => break,
            Err(e @ Error::Corruption { .. }) if newest => {
                let valid = reader.offset();
                warn!(file_number, valid, dropped = file_len - valid, error = %e, "truncating torn WAL tail");
                OpenOptions::new().write(true).open(&path)?.set_len(valid)?;
                report.truncated_bytes = file_len - valid;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    meta.size = reader.offset();
    debug!(file_number, min_seq = meta.min_seq, max_seq = meta.max_seq, size = meta.size, "WAL segment recovered");
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(pairs: &[(&str, &str)]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (k, v) in pairs {
            batch.put(*k, *v);
        }
        batch
    }

    fn small_segments() -> WalOptions {
        WalOptions {
            segment_size_bytes: 128,
            ..WalOptions::default()
        }
    }

    #[test]
    fn test_wal_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();

        let r1 = wal.append(&batch(&[("key1", "value1")])).unwrap();
        let r2 = wal.append(&batch(&[("key2", "value2"), ("key3", "value3")])).unwrap();
        assert_eq!(r1, SequenceRange { first: 1, last: 1 });
        assert_eq!(r2, SequenceRange { first: 2, last: 3 });
        assert_eq!(wal.last_sequence(), 3);

        let mut seen = Vec::new();
        wal.replay(1, |first, batch| {
            seen.push((first, batch.len()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(1, 1), (2, 2)]);

        // A batch straddling `from` is replayed whole.
        let mut seen = Vec::new();
        wal.replay(3, |first, _| {
            seen.push(first);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();
        assert!(matches!(wal.append(&WriteBatch::new()), Err(Error::InvalidArgument(_))));
        assert_eq!(wal.last_sequence(), 0);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), small_segments(), 0).unwrap();
        for i in 0..20 {
            wal.append(&batch(&[(&format!("key{i}"), "a value of some length")])).unwrap();
        }

        let segments = wal.segments();
        assert!(segments.len() > 2);
        assert!(segments[..segments.len() - 1].iter().all(SegmentMeta::is_sealed));
        assert!(!segments.last().unwrap().is_sealed());

        // Sealed segments cover contiguous, ordered ranges.
        let mut next = 1;
        for meta in segments.iter().filter(|m| !m.is_empty()) {
            assert_eq!(meta.min_seq, Some(next));
            next = meta.max_seq.unwrap() + 1;
        }
        assert_eq!(next, 21);
    }

    #[test]
    fn test_rotate_on_empty_segment_is_noop() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();
        wal.rotate().unwrap();
        assert_eq!(wal.segments().len(), 1);
        wal.append(&batch(&[("a", "1")])).unwrap();
        wal.rotate().unwrap();
        assert_eq!(wal.segments().len(), 2);
        assert_eq!(wal.active_file_number(), 2);
    }

    #[test]
    fn test_purge_respects_floor_and_never_touches_active() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), small_segments(), 0).unwrap();
        for i in 0..20 {
            wal.append(&batch(&[(&format!("key{i}"), "a value of some length")])).unwrap();
        }
        let before = wal.segments();

        let deleted = wal.purge(1, SystemTime::now()).unwrap();
        assert!(deleted.is_empty());

        let first_max = before[0].max_seq.unwrap();
        let deleted = wal.purge(first_max + 1, SystemTime::now()).unwrap();
        assert_eq!(deleted, vec![before[0].file_number]);
        assert!(!segment_path(dir.path(), before[0].file_number).exists());
        assert_eq!(wal.earliest_available_sequence(), first_max + 1);

        wal.purge(SeqNum::MAX, SystemTime::now()).unwrap();
        let after = wal.segments();
        assert_eq!(after.len(), 1);
        assert!(!after[0].is_sealed());
    }

    #[test]
    fn test_purge_waits_for_ttl() {
        let dir = TempDir::new().unwrap();
        let options = WalOptions {
            ttl: Duration::from_secs(60),
            ..WalOptions::default()
        };
        let wal = Wal::open(dir.path(), options, 0).unwrap();
        wal.append(&batch(&[("a", "1")])).unwrap();
        wal.rotate().unwrap();

        assert!(wal.purge(SeqNum::MAX, SystemTime::now()).unwrap().is_empty());
        let later = SystemTime::now() + Duration::from_secs(61);
        assert_eq!(wal.purge(SeqNum::MAX, later).unwrap(), vec![1]);
    }

    #[test]
    fn test_recovery_continues_sequences() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(dir.path(), small_segments(), 0).unwrap();
            for i in 0..10 {
                wal.append(&batch(&[(&format!("key{i}"), "a value of some length")])).unwrap();
            }
        }

        let wal = Wal::open(dir.path(), small_segments(), 0).unwrap();
        assert_eq!(wal.recovery_report().records, 10);
        assert_eq!(wal.last_sequence(), 10);
        assert_eq!(wal.append(&batch(&[("next", "v")])).unwrap().first, 11);

        let fresh = TempDir::new().unwrap();
        let wal = Wal::open(fresh.path(), WalOptions::default(), 41).unwrap();
        assert_eq!(wal.earliest_available_sequence(), 42);
        assert_eq!(wal.append(&batch(&[("a", "1")])).unwrap().first, 42);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();
            wal.append(&batch(&[("a", "1")])).unwrap();
            wal.append(&batch(&[("b", "2")])).unwrap();
        }
        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();
        assert_eq!(wal.recovery_report().records, 1);
        assert!(wal.recovery_report().truncated_bytes > 0);
        assert_eq!(wal.last_sequence(), 1);
        assert_eq!(wal.append(&batch(&[("c", "3")])).unwrap().first, 2);
        drop(wal);

        // The truncated segment is no longer the newest, and still reads back.
        let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();
        assert_eq!(wal.last_sequence(), 2);
    }

    #[test]
    fn test_corruption_in_sealed_segment_is_reported() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();
            wal.append(&batch(&[("a", "1")])).unwrap();
            wal.rotate().unwrap();
            wal.append(&batch(&[("b", "2")])).unwrap();
        }
        let path = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = Wal::open(dir.path(), WalOptions::default(), 0).err().unwrap();
        assert!(matches!(err, Error::Corruption { file_number: 1, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_recovery_rejects_sequence_gap() {
        let dir = TempDir::new().unwrap();
        let mut first = encode_record(1, &batch(&[("a", "1")]));
        first.extend(encode_record(2, &batch(&[("b", "2")])));
        fs::write(segment_path(dir.path(), 1), first).unwrap();
        fs::write(segment_path(dir.path(), 2), encode_record(5, &batch(&[("c", "3")]))).unwrap();

        let err = Wal::open(dir.path(), WalOptions::default(), 0).err().unwrap();
        assert!(matches!(err, Error::SequenceGap { expected: 3, found: 5 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_persisted_sequence_past_log_end_retires_segments() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();
            for key in ["a", "b", "c", "d", "e"] {
                wal.append(&batch(&[(key, "v")])).unwrap();
            }
        }

        {
            let wal = Wal::open(dir.path(), WalOptions::default(), 10).unwrap();
            assert_eq!(wal.recovery_report().retired_segments, 1);
            assert!(!segment_path(dir.path(), 1).exists());
            assert_eq!(wal.earliest_available_sequence(), 11);
            assert_eq!(wal.append(&batch(&[("f", "v")])).unwrap().first, 11);
        }

        // The log restarted cleanly, so it reopens and replays.
        let wal = Wal::open(dir.path(), WalOptions::default(), 10).unwrap();
        assert_eq!(wal.recovery_report().retired_segments, 0);
        assert_eq!(wal.last_sequence(), 11);
        let mut seen = Vec::new();
        wal.replay(1, |first, _| {
            seen.push(first);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![11]);
    }

    #[test]
    fn test_failed_write_poisons_log() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), WalOptions::default(), 0).unwrap();
        wal.append(&batch(&[("a", "1")])).unwrap();

        // Swap in a read-only handle so the next flush fails.
        {
            let mut writer = wal.writer.lock();
            let read_only = File::open(segment_path(dir.path(), writer.file_number)).unwrap();
            writer.file = BufWriter::new(read_only);
        }

        let err = wal.append(&batch(&[("b", "2")])).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(wal.is_poisoned());
        assert!(matches!(wal.append(&batch(&[("c", "3")])), Err(Error::Poisoned(_))));
        assert!(matches!(wal.sync(), Err(Error::Poisoned(_))));
        assert_eq!(wal.last_sequence(), 1);
    }

    #[test]
    fn test_wait_for_sequence() {
        let dir = TempDir::new().unwrap();
        let wal = std::sync::Arc::new(Wal::open(dir.path(), WalOptions::default(), 0).unwrap());
        assert!(!wal.wait_for_sequence(1, Duration::from_millis(10)));

        let writer = {
            let wal = std::sync::Arc::clone(&wal);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                wal.append(&batch(&[("a", "1")])).unwrap();
            })
        };
        let mut ready = false;
        for _ in 0..100 {
            if wal.wait_for_sequence(1, Duration::from_millis(50)) {
                ready = true;
                break;
            }
        }
        writer.join().unwrap();
        assert!(ready);
    }
}
