//! Bump allocator owning the value bytes copied into a memtable.
//!
//! Memory is carved out of fixed-size blocks. There is no per-allocation
//! free: every block lives until [`Arena::release`] or until the arena is
//! dropped, which happens once, when the owning memtable is destroyed.
//!
//! Concurrent writers reserve space by advancing the current block's fill
//! mark with a compare-exchange; only installing a new block takes the write
//! lock. Reserved ranges never overlap, so the copies need no lock at all.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Opaque location of an allocation inside an [`Arena`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArenaHandle {
    block: u32,
    offset: u32,
    len: u32,
}

impl ArenaHandle {
    const EMPTY: ArenaHandle = ArenaHandle {
        block: 0,
        offset: 0,
        len: 0,
    };

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Block {
    data: Box<[UnsafeCell<u8>]>,
    used: AtomicUsize,
}

// SAFETY: bytes are only written through ranges handed out once by
// `reserve`, and only read back after the handle has been published to
// readers through the skip list's release/acquire edges.
unsafe impl Sync for Block {}

impl Block {
    fn new(capacity: usize) -> Self {
        Self {
            data: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            used: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn remaining(&self) -> usize {
        self.capacity() - self.used.load(Ordering::Acquire)
    }

    /// Claims `len` bytes, returning their offset, or `None` if the block is
    /// too full.
    fn reserve(&self, len: usize) -> Option<usize> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let end = used.checked_add(len).filter(|end| *end <= self.capacity())?;
            match self
                .used
                .compare_exchange_weak(used, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(used),
                Err(actual) => used = actual,
            }
        }
    }

    /// # Safety
    /// `offset..offset + bytes.len()` must come from a single `reserve` call.
    unsafe fn fill(&self, offset: usize, bytes: &[u8]) {
        let dst = UnsafeCell::raw_get(self.data[offset..].as_ptr());
        // SAFETY: the range is in bounds and exclusively owned by the caller.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    fn base(&self) -> *const u8 {
        UnsafeCell::raw_get(self.data.as_ptr()) as *const u8
    }
}

pub struct Arena {
    blocks: RwLock<Vec<Block>>,
    /// Block serving small allocations.
    current: AtomicUsize,
    block_size: usize,
    /// Zero means unlimited.
    limit: usize,
    reserved: AtomicUsize,
    released: AtomicBool,
}

impl Arena {
    pub fn new(block_size: usize, limit: usize) -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            current: AtomicUsize::new(0),
            // Handles address blocks with 32-bit offsets.
            block_size: block_size.clamp(64, u32::MAX as usize),
            limit,
            reserved: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Copies `bytes` into the arena.
    pub fn allocate(&self, bytes: &[u8]) -> Result<ArenaHandle> {
        if bytes.is_empty() {
            return Ok(ArenaHandle::EMPTY);
        }
        if bytes.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "allocation of {} bytes exceeds the arena maximum",
                bytes.len()
            )));
        }

        // Large allocations get their own block so they don't waste the
        // tail of the shared one.
        if bytes.len() > self.block_size / 4 {
            let mut blocks = self.blocks.write();
            self.check_live()?;
            self.charge(bytes.len())?;
            let block = Block::new(bytes.len());
            let offset = block.reserve(bytes.len()).unwrap_or_default();
            // SAFETY: the block was just created and the range just reserved.
            unsafe { block.fill(offset, bytes) };
            blocks.push(block);
            return Ok(Self::handle(blocks.len() - 1, offset, bytes.len()));
        }

        loop {
            {
                let blocks = self.blocks.read();
                self.check_live()?;
                let index = self.current.load(Ordering::Acquire);
                if let Some(block) = blocks.get(index) {
                    if let Some(offset) = block.reserve(bytes.len()) {
                        // SAFETY: the range was reserved by this call alone.
                        unsafe { block.fill(offset, bytes) };
                        return Ok(Self::handle(index, offset, bytes.len()));
                    }
                }
            }

            let mut blocks = self.blocks.write();
            self.check_live()?;
            let index = self.current.load(Ordering::Acquire);
            let full = blocks.get(index).is_none_or(|b| b.remaining() < bytes.len());
            if full {
                self.charge(self.block_size)?;
                blocks.push(Block::new(self.block_size));
                self.current.store(blocks.len() - 1, Ordering::Release);
            }
        }
    }

    /// Bytes backing an allocation.
    ///
    /// # Panics
    /// If the arena was released. Handles are only reachable through a live
    /// memtable reference, which keeps the arena from being released.
    pub fn get(&self, handle: ArenaHandle) -> &[u8] {
        if handle.is_empty() {
            return &[];
        }
        let base = {
            let blocks = self.blocks.read();
            blocks[handle.block as usize].base()
        };
        // SAFETY: block storage is boxed, so it does not move when the block
        // vector grows, and it is freed only by `release`/drop, which require
        // that no handle is still being resolved. The range was fully written
        // before the handle was handed out.
        unsafe {
            std::slice::from_raw_parts(base.add(handle.offset as usize), handle.len as usize)
        }
    }

    /// Bytes reserved from the system, including unused block tails.
    pub fn memory_usage(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Frees every block at once. Later allocations fail.
    pub fn release(&self) {
        let mut blocks = self.blocks.write();
        self.released.store(true, Ordering::Release);
        blocks.clear();
        blocks.shrink_to_fit();
    }

    fn check_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(Error::InvalidArgument("arena already released".into()));
        }
        Ok(())
    }

    fn charge(&self, bytes: usize) -> Result<()> {
        let reserved = self.reserved.load(Ordering::Relaxed);
        if self.limit > 0 && reserved + bytes > self.limit {
            return Err(Error::ArenaExhausted { limit: self.limit });
        }
        self.reserved.store(reserved + bytes, Ordering::Relaxed);
        Ok(())
    }

    fn handle(block: usize, offset: usize, len: usize) -> ArenaHandle {
        ArenaHandle {
            block: block as u32,
            offset: offset as u32,
            len: len as u32,
        }
    }
}
