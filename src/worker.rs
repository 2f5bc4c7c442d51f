//! # Per-slot worker record: identity, generation, request accounting.
//!
//! A [`Worker`] is bookkeeping for one pool slot. The slot index is assigned
//! once at pool creation and reused across generations; "terminated" only
//! ever applies to an individual process instance, never to the slot.
//!
//! Two copies of this record exist per slot: the supervisor's authoritative
//! `pid`/`generation` bookkeeping, and the child's own copy (inherited at
//! fork) whose `requests_count` is the authoritative one. The supervisor's
//! count is only ever updated from the worker's progress reports, never by
//! reaching into the child.

use nix::unistd::Pid;

/// Lifecycle phase of the process currently occupying a slot.
///
/// ```text
/// Starting → Serving → ReforkRequested → Draining
///     ▲                                     │
///     └──────── next generation ◄───────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Forked, not yet heartbeating.
    Starting,
    /// Heartbeating and serving traffic.
    Serving,
    /// The refork condition was met; a replacement fork is pending.
    ReforkRequested,
    /// Replaced; the outgoing process is finishing in-flight work.
    Draining,
}

/// Bookkeeping record for one worker slot.
#[derive(Clone, Debug)]
pub struct Worker {
    slot: usize,
    pid: Pid,
    generation: u64,
    requests_count: u64,
    state: WorkerState,
}

impl Worker {
    /// Creates the record for `slot`, generation 0, occupied by `pid`.
    pub fn new(slot: usize, pid: Pid) -> Self {
        Self {
            slot,
            pid,
            generation: 0,
            requests_count: 0,
            state: WorkerState::Starting,
        }
    }

    /// Builds the child process's own copy of the record right after fork,
    /// at the generation the supervisor is promoting the slot to.
    pub(crate) fn for_child(slot: usize, pid: Pid, generation: u64) -> Self {
        Self {
            slot,
            pid,
            generation,
            requests_count: 0,
            state: WorkerState::Starting,
        }
    }

    /// Stable slot index, fixed for the pool's lifetime.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Pid of the process currently occupying the slot; changes on every
    /// refork.
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// How many times this slot has been reforked. Strictly increasing.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Units of work completed by the current generation (as last observed,
    /// on the supervisor side).
    #[inline]
    pub fn requests_count(&self) -> u64 {
        self.requests_count
    }

    /// Current lifecycle phase.
    #[inline]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Advances the lifecycle phase.
    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
    }

    /// Adds `n` completed units of work.
    pub fn increment_requests_count(&mut self, n: u64) {
        self.requests_count += n;
    }

    /// Overwrites the observed count from a progress report.
    pub(crate) fn observe_requests_count(&mut self, total: u64) {
        self.requests_count = total;
    }

    /// Records a successful replacement fork: `pid` becomes `new_pid` and
    /// the generation advances by one.
    ///
    /// Deliberately does **not** clear `requests_count`: resetting is a
    /// distinct step ([`reset`](Self::reset)) performed by the new process
    /// itself, so the outgoing generation's final count stays inspectable
    /// in between.
    pub fn promote(&mut self, new_pid: Pid) {
        self.pid = new_pid;
        self.generation += 1;
        self.state = WorkerState::Starting;
    }

    /// Clears the request count. Invoked by the new process once it begins
    /// serving, after the supervisor has already recorded the promotion.
    pub fn reset(&mut self) {
        self.requests_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Worker {
        Worker::new(0, Pid::from_raw(42))
    }

    #[test]
    fn test_new_worker_starts_at_generation_zero() {
        let w = worker();
        assert_eq!(w.slot(), 0);
        assert_eq!(w.pid(), Pid::from_raw(42));
        assert_eq!(w.generation(), 0);
        assert_eq!(w.requests_count(), 0);
        assert_eq!(w.state(), WorkerState::Starting);
    }

    #[test]
    fn test_promote_then_reset() {
        let mut w = worker();
        w.increment_requests_count(17);

        w.promote(Pid::from_raw(100));
        // Promotion advances identity but keeps the outgoing count visible.
        assert_eq!(w.pid(), Pid::from_raw(100));
        assert_eq!(w.generation(), 1);
        assert_eq!(w.requests_count(), 17);

        w.reset();
        assert_eq!(w.requests_count(), 0);
        assert_eq!(w.generation(), 1);
    }

    #[test]
    fn test_generation_is_strictly_increasing() {
        let mut w = worker();
        for expected in 1..=5 {
            w.promote(Pid::from_raw(100 + expected as i32));
            assert_eq!(w.generation(), expected);
        }
    }

    #[test]
    fn test_increment_accumulates() {
        let mut w = worker();
        w.increment_requests_count(1);
        w.increment_requests_count(10);
        assert_eq!(w.requests_count(), 11);
    }
}
