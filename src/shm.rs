//! # Shared health segment: fork-visible worker deadlines + shutdown flag.
//!
//! [`HealthSegment`] is a fixed-size, multi-process table created **once at
//! boot, before the first fork**, as an anonymous `MAP_SHARED` mapping. Every
//! forked worker inherits the same physical pages, so a deadline written by a
//! worker is immediately visible to the supervisor and to any health-check
//! collaborator, without pipes or locks.
//!
//! ## Layout
//! ```text
//! ┌──────────┬──────────┬─────┬────────────┬──────────────┐
//! │ slot 0   │ slot 1   │ ... │ slot N-1   │ shutdown     │
//! │ f64 bits │ f64 bits │     │ f64 bits   │ 0 / 1        │
//! └──────────┴──────────┴─────┴────────────┴──────────────┘
//!   one aligned u64 word per entry, never resized after creation
//! ```
//!
//! ## Rules
//! - Each deadline word has exactly **one writer**: the owning worker.
//! - The shutdown word has exactly one writer: the supervisor.
//! - Words are aligned 8-byte atomics, so readers never observe a torn value;
//!   no locking anywhere.
//! - A worker whose deadline is at or below "now" is treated as hung and
//!   excluded from the live count, even if its process still exists.
//!   Staleness bounded by the supervisor's poll interval is acceptable.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::libc::c_void;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::time::{clock_gettime, ClockId};

use crate::error::PoolError;

/// Fork-shared table of per-slot liveness deadlines plus one shutdown flag.
///
/// Deadlines are monotonic-clock timestamps (seconds, as `f64`) stored as
/// their bit pattern in an `AtomicU64`. Viewed from the owning worker a
/// deadline is non-decreasing, except immediately after that worker's own
/// restart.
pub struct HealthSegment {
    base: NonNull<c_void>,
    capacity: usize,
    bytes: usize,
}

// The mapping is plain shared memory addressed through atomics.
unsafe impl Send for HealthSegment {}
unsafe impl Sync for HealthSegment {}

impl HealthSegment {
    /// Maps a new anonymous shared segment sized for `workers` slots.
    ///
    /// Must be called in the supervisor before the first fork so every
    /// worker inherits the mapping. The segment lives for the supervisor
    /// process's entire lifetime; there is no teardown beyond process exit.
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        let bytes = (workers + 1) * std::mem::size_of::<AtomicU64>();
        let len = NonZeroUsize::new(bytes).ok_or(PoolError::Segment {
            errno: nix::errno::Errno::EINVAL,
        })?;
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|errno| PoolError::Segment { errno })?;
        // Fresh anonymous pages are zero-filled: all deadlines start at 0.0
        // (dead) and the shutdown flag starts cleared.
        Ok(Self {
            base,
            capacity: workers,
            bytes,
        })
    }

    /// Number of worker slots the segment was sized for.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        assert!(index <= self.capacity, "health segment index out of range");
        unsafe { &*self.base.as_ptr().cast::<AtomicU64>().add(index) }
    }

    /// Overwrites `slot`'s deadline. Called by the owning worker on its
    /// heartbeat cadence (around request completion).
    pub fn set_deadline(&self, slot: usize, deadline: f64) {
        assert!(slot < self.capacity, "slot out of range");
        self.word(slot).store(deadline.to_bits(), Ordering::Release);
    }

    /// Reads `slot`'s current deadline.
    pub fn deadline(&self, slot: usize) -> f64 {
        assert!(slot < self.capacity, "slot out of range");
        f64::from_bits(self.word(slot).load(Ordering::Acquire))
    }

    /// Raises the global shutdown flag. Idempotent; settable only by the
    /// supervisor (by convention: the flag has a single writer).
    pub fn begin_shutdown(&self) {
        self.word(self.capacity).store(1, Ordering::Release);
    }

    /// Returns true once shutdown has begun.
    ///
    /// Readable from any process sharing the segment. Useful for health
    /// check endpoints: they can report unhealthy immediately after a
    /// termination signal was received, before the serving loop itself
    /// stops accepting.
    pub fn is_shutting_down(&self) -> bool {
        self.word(self.capacity).load(Ordering::Acquire) != 0
    }

    /// Counts slots whose deadline is strictly in the future.
    ///
    /// A slot at or below `now` is excluded even if its process is
    /// otherwise still running.
    pub fn live_workers_count(&self, now: f64) -> usize {
        (0..self.capacity)
            .filter(|&slot| self.deadline(slot) > now)
            .count()
    }

    /// Current monotonic-clock time in seconds.
    ///
    /// The monotonic clock is system-wide, so timestamps written by one
    /// process compare meaningfully in another.
    pub fn now() -> f64 {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => ts.tv_sec() as f64 + ts.tv_nsec() as f64 * 1e-9,
            // CLOCK_MONOTONIC is always available on the platforms we
            // support; EINVAL would mean the clock id itself is missing.
            Err(_) => 0.0,
        }
    }
}

impl Drop for HealthSegment {
    fn drop(&mut self) {
        // Unmaps this process's view only; other processes sharing the
        // pages are unaffected.
        let _ = unsafe { munmap(self.base, self.bytes) };
    }
}
