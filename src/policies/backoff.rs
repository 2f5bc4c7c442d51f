//! # Backoff policy for refork conditions.
//!
//! After a refork attempt is refused (fork-unsafe process) or fails, the
//! condition that triggered it must not re-signal on every poll tick.
//! [`BackoffPolicy`] decides how the suppression is lifted:
//!
//! - [`BackoffPolicy::Manual`] — suppressed until explicitly cleared;
//! - [`BackoffPolicy::Cooldown`] — suppressed for a window, optionally
//!   jittered, then automatically lifted.
//!
//! This is rate limiting, not an error channel: engaging backoff absorbs
//! repeated "not ready to refork" signals without raising.
//!
//! # Example
//! ```rust
//! use std::time::{Duration, Instant};
//! use forkvisor::{BackoffPolicy, BackoffState, JitterPolicy};
//!
//! let policy = BackoffPolicy::Cooldown {
//!     window: Duration::from_secs(10),
//!     jitter: JitterPolicy::None,
//! };
//!
//! let mut state = BackoffState::new();
//! let now = Instant::now();
//! assert!(!state.is_active(now));
//!
//! state.engage(&policy, now);
//! assert!(state.is_active(now));
//! assert!(!state.is_active(now + Duration::from_secs(10)));
//! ```

use std::time::{Duration, Instant};

use rand::Rng;

/// Randomization applied to a cooldown window, to keep several slots that
/// backed off together from re-qualifying on the same tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Use the exact window.
    None,
    /// Random window in `[0, window]`.
    Full,
    /// `window/2 + random[0, window/2]` — balanced (keeps at least half).
    Equal,
}

impl Default for JitterPolicy {
    /// Returns [`JitterPolicy::None`].
    fn default() -> Self {
        JitterPolicy::None
    }
}

impl JitterPolicy {
    /// Applies jitter to the given window.
    pub fn apply(&self, window: Duration) -> Duration {
        let ms = window.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => window,
            JitterPolicy::Full => Duration::from_millis(rng.random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                let jitter = if half == 0 {
                    0
                } else {
                    rng.random_range(0..=half)
                };
                Duration::from_millis(half + jitter)
            }
        }
    }
}

/// How a refork condition's suppression is lifted after it backs off.
#[derive(Clone, Copy, Debug)]
pub enum BackoffPolicy {
    /// Suppressed until [`BackoffState::clear`] is called.
    Manual,
    /// Suppressed for `window` (after jitter), then lifted automatically.
    Cooldown {
        /// Base suppression window.
        window: Duration,
        /// Randomization applied to the window.
        jitter: JitterPolicy,
    },
}

impl Default for BackoffPolicy {
    /// Returns a 10-second cooldown with no jitter.
    fn default() -> Self {
        BackoffPolicy::Cooldown {
            window: Duration::from_secs(10),
            jitter: JitterPolicy::None,
        }
    }
}

/// Suppression currently in force.
#[derive(Clone, Copy, Debug)]
enum Suppression {
    /// Active until an explicit clear.
    UntilCleared,
    /// Active while `now < deadline`.
    Until(Instant),
}

/// Live backoff state for one refork condition.
///
/// Persists across a worker's promotion/reset: backoff exists to survive
/// the very transition that triggered it, so that transition must not clear
/// it.
#[derive(Clone, Copy, Debug, Default)]
pub struct BackoffState {
    suppression: Option<Suppression>,
}

impl BackoffState {
    /// Creates an inactive state.
    pub fn new() -> Self {
        Self { suppression: None }
    }

    /// Engages suppression according to `policy`, anchored at `now`.
    pub fn engage(&mut self, policy: &BackoffPolicy, now: Instant) {
        self.suppression = Some(match policy {
            BackoffPolicy::Manual => Suppression::UntilCleared,
            BackoffPolicy::Cooldown { window, jitter } => {
                Suppression::Until(now + jitter.apply(*window))
            }
        });
    }

    /// Lifts the suppression regardless of policy.
    pub fn clear(&mut self) {
        self.suppression = None;
    }

    /// Returns true while positive condition results must be suppressed.
    pub fn is_active(&self, now: Instant) -> bool {
        match self.suppression {
            None => false,
            Some(Suppression::UntilCleared) => true,
            Some(Suppression::Until(deadline)) => now < deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_is_inactive() {
        let state = BackoffState::new();
        assert!(!state.is_active(Instant::now()));
    }

    #[test]
    fn test_manual_backoff_requires_explicit_clear() {
        let mut state = BackoffState::new();
        let now = Instant::now();
        state.engage(&BackoffPolicy::Manual, now);

        assert!(state.is_active(now));
        assert!(state.is_active(now + Duration::from_secs(3600)));

        state.clear();
        assert!(!state.is_active(now));
    }

    #[test]
    fn test_cooldown_expires_on_its_own() {
        let mut state = BackoffState::new();
        let now = Instant::now();
        state.engage(
            &BackoffPolicy::Cooldown {
                window: Duration::from_secs(10),
                jitter: JitterPolicy::None,
            },
            now,
        );

        assert!(state.is_active(now));
        assert!(state.is_active(now + Duration::from_millis(9_999)));
        assert!(!state.is_active(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_window_cooldown_never_suppresses() {
        let mut state = BackoffState::new();
        let now = Instant::now();
        state.engage(
            &BackoffPolicy::Cooldown {
                window: Duration::ZERO,
                jitter: JitterPolicy::None,
            },
            now,
        );
        assert!(!state.is_active(now));
    }

    #[test]
    fn test_clear_also_lifts_cooldown() {
        let mut state = BackoffState::new();
        let now = Instant::now();
        state.engage(&BackoffPolicy::default(), now);
        assert!(state.is_active(now));
        state.clear();
        assert!(!state.is_active(now));
    }

    #[test]
    fn test_full_jitter_stays_within_window() {
        let window = Duration::from_millis(1000);
        for _ in 0..100 {
            assert!(JitterPolicy::Full.apply(window) <= window);
        }
    }

    #[test]
    fn test_equal_jitter_keeps_at_least_half() {
        let window = Duration::from_millis(1000);
        for _ in 0..100 {
            let applied = JitterPolicy::Equal.apply(window);
            assert!(applied >= Duration::from_millis(500));
            assert!(applied <= window);
        }
    }
}
