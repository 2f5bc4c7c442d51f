//! # Global pool configuration.
//!
//! Provides [`Config`], the centralized settings for a worker pool:
//!
//! - **Sizing**: number of worker slots (fixed for the pool's lifetime).
//! - **Liveness**: heartbeat timeout and supervisor tick interval.
//! - **Reforking**: the request-count threshold ladder and backoff policy.
//! - **Shutdown**: grace period before stragglers are force-killed.
//!
//! ## Sentinel values
//! - `refork_thresholds = []` → reforking disabled (no slot ever qualifies)
//! - `grace = 0s` → no wait, force-kill immediately on drain

use std::time::Duration;

use crate::policies::BackoffPolicy;

/// Global configuration for a prefork worker pool.
///
/// ## Field semantics
/// - `workers`: slot count; slots are assigned once at pool creation and
///   reused across generations
/// - `timeout`: a worker whose shared deadline is more than this far in the
///   past is treated as hung and excluded from the live count
/// - `tick`: supervisor poll interval; the supervisor's view of worker
///   health is stale by at most this much (acceptable by design)
/// - `refork_thresholds`: per-generation request-count ladder; `None` marks
///   a generation terminal (never reforked)
/// - `backoff`: what happens after a refork attempt was refused or failed
/// - `grace`: maximum wait for workers to exit during drain
///
/// All fields are public; prefer the helper accessors over sprinkling
/// sentinel checks across the codebase.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of worker slots in the pool.
    pub workers: usize,

    /// Heartbeat timeout: each heartbeat arms the worker's deadline to
    /// `now + timeout`.
    pub timeout: Duration,

    /// Supervisor tick interval (health poll + refork evaluation cadence).
    pub tick: Duration,

    /// Request-count threshold per generation.
    ///
    /// Indexed by generation; a generation past the end of the ladder uses
    /// the **last** entry. `None` (or an empty ladder) never triggers.
    pub refork_thresholds: Vec<Option<u64>>,

    /// Backoff applied to a slot's refork condition after a refused or
    /// failed refork attempt.
    pub backoff: BackoffPolicy,

    /// Maximum time to wait for workers to exit during drain before
    /// escalating to SIGKILL.
    pub grace: Duration,
}

impl Config {
    /// Returns true if the threshold ladder can ever trigger a refork.
    #[inline]
    pub fn refork_enabled(&self) -> bool {
        self.refork_thresholds.iter().any(|t| t.is_some())
    }

    /// Returns the tick interval clamped to a minimum of 1ms, so a
    /// zero-tick configuration cannot turn the supervisor loop into a
    /// busy-wait.
    #[inline]
    pub fn tick_clamped(&self) -> Duration {
        self.tick.max(Duration::from_millis(1))
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `workers = 1`
    /// - `timeout = 20s`
    /// - `tick = 1s`
    /// - `refork_thresholds = []` (reforking disabled)
    /// - `backoff = BackoffPolicy::default()` (10s cooldown, no jitter)
    /// - `grace = 30s`
    fn default() -> Self {
        Self {
            workers: 1,
            timeout: Duration::from_secs(20),
            tick: Duration::from_secs(1),
            refork_thresholds: Vec::new(),
            backoff: BackoffPolicy::default(),
            grace: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_disables_reforking() {
        let cfg = Config::default();
        assert!(!cfg.refork_enabled());
    }

    #[test]
    fn test_all_none_ladder_is_disabled() {
        let cfg = Config {
            refork_thresholds: vec![None, None],
            ..Config::default()
        };
        assert!(!cfg.refork_enabled());
    }

    #[test]
    fn test_any_threshold_enables_reforking() {
        let cfg = Config {
            refork_thresholds: vec![Some(1000), None],
            ..Config::default()
        };
        assert!(cfg.refork_enabled());
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let cfg = Config {
            tick: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(cfg.tick_clamped(), Duration::from_millis(1));
    }
}
