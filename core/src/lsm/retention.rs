//! Retention pins held by live change cursors.
//!
//! Each cursor owns a [`RetentionLease`] recording the oldest sequence it
//! may still read. The WAL purge never deletes a segment holding a pinned
//! sequence. Leases idle past the timeout are evicted so an abandoned
//! consumer cannot hold the log forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::types::SeqNum;
use crate::error::Result;

struct LeaseState {
    pinned: Arc<AtomicU64>,
    /// Milliseconds since the registry epoch.
    touched: Arc<AtomicU64>,
    expired: Arc<AtomicBool>,
}

pub struct RetentionRegistry {
    /// Serializes lease registration against floor computation and purge.
    gate: Mutex<()>,
    leases: DashMap<u64, LeaseState>,
    next_id: AtomicU64,
    /// Zero disables expiry.
    lease_timeout: Duration,
    epoch: Instant,
}

impl RetentionRegistry {
    pub fn new(lease_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            gate: Mutex::new(()),
            leases: DashMap::new(),
            next_id: AtomicU64::new(1),
            lease_timeout,
            epoch: Instant::now(),
        })
    }

    pub fn lock_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    /// Registers a lease pinned at `pinned` once `validate` succeeds. Both
    /// run under the gate, so no purge can slip in between the check and
    /// the registration.
    pub fn acquire<F>(self: &Arc<Self>, pinned: SeqNum, validate: F) -> Result<RetentionLease>
    where
        F: FnOnce() -> Result<()>,
    {
        let _gate = self.gate.lock();
        validate()?;
        Ok(self.register(pinned))
    }

    fn register(self: &Arc<Self>, pinned: SeqNum) -> RetentionLease {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = LeaseState {
            pinned: Arc::new(AtomicU64::new(pinned)),
            touched: Arc::new(AtomicU64::new(self.millis_since_epoch(Instant::now()))),
            expired: Arc::new(AtomicBool::new(false)),
        };
        let lease = RetentionLease {
            id,
            registry: Arc::clone(self),
            pinned: Arc::clone(&state.pinned),
            touched: Arc::clone(&state.touched),
            expired: Arc::clone(&state.expired),
        };
        self.leases.insert(id, state);
        debug!(lease_id = id, pinned, "retention lease acquired");
        lease
    }

    /// Smallest sequence pinned by a live lease.
    pub fn min_pinned(&self) -> Option<SeqNum> {
        self.leases
            .iter()
            .map(|entry| entry.value().pinned.load(Ordering::Acquire))
            .min()
    }

    /// Evicts leases idle for longer than the timeout as of `now`.
    /// Returns the evicted lease ids.
    pub fn expire_idle(&self, now: Instant) -> Vec<u64> {
        if self.lease_timeout.is_zero() {
            return Vec::new();
        }
        let now_ms = self.millis_since_epoch(now);
        let timeout_ms = self.lease_timeout.as_millis() as u64;

        let idle: Vec<u64> = self
            .leases
            .iter()
            .filter(|entry| now_ms.saturating_sub(entry.value().touched.load(Ordering::Acquire)) > timeout_ms)
            .map(|entry| *entry.key())
            .collect();

        for id in &idle {
            if let Some((_, state)) = self.leases.remove(id) {
                state.expired.store(true, Ordering::Release);
                warn!(
                    lease_id = id,
                    pinned = state.pinned.load(Ordering::Acquire),
                    "change cursor lease expired"
                );
            }
        }
        idle
    }

    pub fn live_count(&self) -> usize {
        self.leases.len()
    }

    fn millis_since_epoch(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

/// A cursor's pin on the log. Dropping it releases the pin.
pub struct RetentionLease {
    id: u64,
    registry: Arc<RetentionRegistry>,
    pinned: Arc<AtomicU64>,
    touched: Arc<AtomicU64>,
    expired: Arc<AtomicBool>,
}

impl RetentionLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pinned(&self) -> SeqNum {
        self.pinned.load(Ordering::Acquire)
    }

    /// Moves the pin forward. Pins never move backwards.
    pub fn advance(&self, seq: SeqNum) {
        self.pinned.fetch_max(seq, Ordering::AcqRel);
        self.touch();
    }

    pub fn touch(&self) {
        let now = self.registry.millis_since_epoch(Instant::now());
        self.touched.store(now, Ordering::Release);
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

impl Drop for RetentionLease {
    fn drop(&mut self) {
        if self.registry.leases.remove(&self.id).is_some() {
            debug!(lease_id = self.id, "retention lease released");
        }
    }
}
