//! # Refork condition: when does a worker qualify for replacement?
//!
//! A [`ReforkCondition`] is the pluggable predicate the supervisor consults
//! each tick, per slot. It separates the decision policy (testable in
//! isolation, replaceable with memory- or time-based strategies) from the
//! mechanism (fork, descriptor sweep, promotion).
//!
//! The built-in [`RequestsCount`] ladder triggers once a generation has
//! served strictly more requests than its configured threshold:
//!
//! ```text
//! thresholds = [10, 50, None]
//!   gen 0: qualifies after 11 requests
//!   gen 1: qualifies after 51 requests
//!   gen 2+: terminal, never qualifies
//! ```
//!
//! # Example
//! ```rust
//! use nix::unistd::Pid;
//! use forkvisor::{BackoffPolicy, ReforkCondition, RequestsCount, Worker};
//!
//! let mut cond = RequestsCount::new(vec![Some(10)], BackoffPolicy::Manual);
//! let mut worker = Worker::new(0, Pid::from_raw(42));
//!
//! worker.increment_requests_count(10);
//! assert!(!cond.met(&worker)); // strict: 10 > 10 is false
//! worker.increment_requests_count(1);
//! assert!(cond.met(&worker));
//! ```

use std::time::Instant;

use tracing::info;

use crate::policies::backoff::{BackoffPolicy, BackoffState};
use crate::worker::Worker;

/// Pluggable predicate deciding whether a worker qualifies for replacement.
pub trait ReforkCondition: Send {
    /// Returns true iff the worker currently qualifies. A pure query apart
    /// from a diagnostic emitted on the not-met → met transition.
    fn met(&mut self, worker: &Worker) -> bool;

    /// Suppresses positive results after a refork attempt was refused or
    /// failed, so the condition does not re-signal every poll tick.
    fn backoff(&mut self);

    /// Lifts the suppression. Only meaningful for
    /// [`BackoffPolicy::Manual`]; cooldowns lift themselves.
    fn clear_backoff(&mut self) {}
}

/// Request-count threshold ladder, one entry per generation.
///
/// - A generation past the end of the ladder uses the **last** entry.
/// - `None` marks a generation terminal: it never qualifies. A ladder
///   ending in `None` therefore stops reforking permanently.
/// - An empty ladder never qualifies at all.
///
/// Backoff state deliberately persists across a worker's promotion/reset:
/// its purpose is to survive the very transition that triggered it.
pub struct RequestsCount {
    thresholds: Vec<Option<u64>>,
    policy: BackoffPolicy,
    state: BackoffState,
    last_met: bool,
}

impl RequestsCount {
    /// Creates a ladder with the given thresholds and backoff policy.
    pub fn new(thresholds: Vec<Option<u64>>, policy: BackoffPolicy) -> Self {
        Self {
            thresholds,
            policy,
            state: BackoffState::new(),
            last_met: false,
        }
    }

    /// Threshold applicable to `generation`: the indexed entry when in
    /// range, otherwise the last defined entry.
    fn threshold(&self, generation: u64) -> Option<u64> {
        match self.thresholds.get(generation as usize) {
            Some(entry) => *entry,
            None => self.thresholds.last().copied().flatten(),
        }
    }

    fn evaluate(&self, worker: &Worker, now: Instant) -> bool {
        if self.state.is_active(now) {
            return false;
        }
        match self.threshold(worker.generation()) {
            Some(limit) => worker.requests_count() > limit,
            None => false,
        }
    }
}

impl ReforkCondition for RequestsCount {
    fn met(&mut self, worker: &Worker) -> bool {
        let met = self.evaluate(worker, Instant::now());
        if met && !self.last_met {
            info!(
                slot = worker.slot(),
                pid = worker.pid().as_raw(),
                generation = worker.generation(),
                requests = worker.requests_count(),
                threshold = ?self.threshold(worker.generation()),
                "worker exceeded its request threshold, refork candidate"
            );
        }
        self.last_met = met;
        met
    }

    fn backoff(&mut self) {
        self.state.engage(&self.policy, Instant::now());
    }

    fn clear_backoff(&mut self) {
        self.state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn worker() -> Worker {
        Worker::new(0, Pid::from_raw(42))
    }

    #[test]
    fn test_threshold_ladder_across_generations() {
        let mut cond = RequestsCount::new(vec![Some(10), Some(50)], BackoffPolicy::Manual);
        let mut w = worker();

        // Generation 0, threshold 10.
        assert!(!cond.met(&w));
        w.increment_requests_count(11);
        assert!(cond.met(&w));

        w.promote(Pid::from_raw(10));
        w.reset();

        // Generation 1, threshold 50.
        assert!(!cond.met(&w));
        w.increment_requests_count(11);
        assert!(!cond.met(&w));
        w.increment_requests_count(40);
        assert!(cond.met(&w));

        w.promote(Pid::from_raw(11));
        w.reset();

        // Generation 2 falls off the ladder; the last entry (50) applies.
        w.increment_requests_count(50);
        assert!(!cond.met(&w));
        w.increment_requests_count(1);
        assert!(cond.met(&w));
    }

    #[test]
    fn test_none_entry_is_terminal() {
        let mut cond = RequestsCount::new(vec![Some(10), None], BackoffPolicy::Manual);
        let mut w = worker();

        w.increment_requests_count(11);
        assert!(cond.met(&w));

        w.promote(Pid::from_raw(10));
        w.reset();

        // Generation 1 is terminal; so is every generation after it.
        assert!(!cond.met(&w));
        w.increment_requests_count(50);
        assert!(!cond.met(&w));

        w.promote(Pid::from_raw(11));
        w.reset();
        w.increment_requests_count(1_000_000);
        assert!(!cond.met(&w));
    }

    #[test]
    fn test_strict_inequality_at_the_boundary() {
        let mut cond = RequestsCount::new(vec![Some(10)], BackoffPolicy::Manual);
        let mut w = worker();

        w.increment_requests_count(10);
        assert!(!cond.met(&w));
        w.increment_requests_count(1);
        assert!(cond.met(&w));
    }

    #[test]
    fn test_empty_ladder_never_qualifies() {
        let mut cond = RequestsCount::new(vec![], BackoffPolicy::Manual);
        let mut w = worker();
        w.increment_requests_count(1_000_000);
        assert!(!cond.met(&w));
    }

    #[test]
    fn test_backoff_suppresses_a_satisfied_threshold() {
        let mut cond = RequestsCount::new(vec![Some(10), None], BackoffPolicy::Manual);
        let mut w = worker();

        w.increment_requests_count(11);
        assert!(cond.met(&w));

        cond.backoff();
        assert!(!cond.met(&w));

        cond.clear_backoff();
        assert!(cond.met(&w));
    }

    #[test]
    fn test_backoff_persists_across_promotion() {
        let mut cond = RequestsCount::new(vec![Some(10), Some(10)], BackoffPolicy::Manual);
        let mut w = worker();

        w.increment_requests_count(11);
        assert!(cond.met(&w));
        cond.backoff();

        // The promotion that backoff was protecting must not clear it.
        w.promote(Pid::from_raw(10));
        w.reset();
        w.increment_requests_count(11);
        assert!(!cond.met(&w));

        cond.clear_backoff();
        assert!(cond.met(&w));
    }

    #[test]
    fn test_zero_cooldown_backoff_lifts_immediately() {
        let policy = BackoffPolicy::Cooldown {
            window: std::time::Duration::ZERO,
            jitter: crate::policies::JitterPolicy::None,
        };
        let mut cond = RequestsCount::new(vec![Some(10)], policy);
        let mut w = worker();

        w.increment_requests_count(11);
        assert!(cond.met(&w));
        cond.backoff();
        assert!(cond.met(&w));
    }
}
