//! Error types used by the forkvisor pool and the process-wide context.
//!
//! This module defines two main error enums:
//!
//! - [`PoolError`] — errors raised by the supervisor / pool machinery.
//! - [`ContextError`] — errors raised by the descriptor registry and the
//!   post-fork descriptor sweep.
//!
//! Both types provide an `as_label` helper (short snake_case tag) for
//! logging and metrics.

use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// # Errors produced by the pool supervisor.
///
/// These represent failures of the supervision machinery itself: refused or
/// failed forks, shared-segment setup, signal wiring, and a drain that
/// overran its grace window.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PoolError {
    /// The configuration was rejected before the pool started.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// The process is no longer fork-safe; the replacement fork was refused.
    ///
    /// Terminal for the process: once [`ProcessContext::mark_fork_unsafe`]
    /// has been called, every subsequent refork attempt ends here. The
    /// refusal is reported (never silently dropped) so an operator can see
    /// why the pool stopped rotating.
    ///
    /// [`ProcessContext::mark_fork_unsafe`]: crate::ProcessContext::mark_fork_unsafe
    #[error("process is no longer fork-safe; refusing to fork worker slot {slot}")]
    ForkUnsafe {
        /// Slot whose replacement fork was refused.
        slot: usize,
    },

    /// The underlying `fork(2)` call failed.
    #[error("fork for worker slot {slot} failed: {errno}")]
    ForkFailed {
        /// Slot being (re)populated.
        slot: usize,
        /// Errno reported by the kernel.
        errno: Errno,
    },

    /// Creating the shared health segment failed.
    #[error("shared health segment: {errno}")]
    Segment {
        /// Errno from `mmap(2)`.
        errno: Errno,
    },

    /// Installing the signal pipe or signal handlers failed.
    #[error("signal setup: {errno}")]
    Signals {
        /// Errno from `pipe2(2)` / `sigaction(2)`.
        errno: Errno,
    },

    /// Creating a worker progress channel failed.
    #[error("progress channel for worker slot {slot}: {errno}")]
    Channel {
        /// Slot the channel belongs to.
        slot: usize,
        /// Errno from `pipe2(2)`.
        errno: Errno,
    },

    /// Drain grace period was exceeded; some workers had to be force-killed.
    #[error("drain grace {grace:?} exceeded; stuck: {stuck:?}; sent SIGKILL")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Pids that did not exit in time.
        stuck: Vec<Pid>,
    },
}

impl PoolError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use std::sync::Arc;
    /// use forkvisor::{Config, ProcessContext, Supervisor};
    ///
    /// let cfg = Config { workers: 0, ..Config::default() };
    /// let err = Supervisor::new(cfg, Arc::new(ProcessContext::new())).err().unwrap();
    /// assert_eq!(err.as_label(), "pool_invalid_config");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            PoolError::InvalidConfig { .. } => "pool_invalid_config",
            PoolError::ForkUnsafe { .. } => "pool_fork_unsafe",
            PoolError::ForkFailed { .. } => "pool_fork_failed",
            PoolError::Segment { .. } => "pool_segment",
            PoolError::Signals { .. } => "pool_signals",
            PoolError::Channel { .. } => "pool_channel",
            PoolError::GraceExceeded { .. } => "pool_grace_exceeded",
        }
    }
}

/// # Errors produced by the process-wide safety context.
///
/// Registering a handle that cannot be resolved to a live descriptor is a
/// programming error and fails immediately; it is never retried.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ContextError {
    /// The given handle does not refer to a live descriptor.
    #[error("descriptor {fd} cannot be kept: {errno}")]
    InvalidDescriptor {
        /// The raw descriptor that failed to resolve.
        fd: std::os::fd::RawFd,
        /// Errno from `fcntl(F_GETFD)` (typically `EBADF`).
        errno: Errno,
    },

    /// Enumerating the process descriptor table failed.
    #[error("descriptor sweep: {0}")]
    Sweep(#[from] std::io::Error),
}

impl ContextError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ContextError::InvalidDescriptor { .. } => "ctx_invalid_descriptor",
            ContextError::Sweep(_) => "ctx_sweep",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_labels_are_stable() {
        let err = PoolError::GraceExceeded {
            grace: Duration::from_secs(5),
            stuck: vec![],
        };
        assert_eq!(err.as_label(), "pool_grace_exceeded");

        let err = PoolError::ForkFailed {
            slot: 0,
            errno: Errno::EAGAIN,
        };
        assert_eq!(err.as_label(), "pool_fork_failed");
    }

    #[test]
    fn test_context_error_display_names_the_descriptor() {
        let err = ContextError::InvalidDescriptor {
            fd: 42,
            errno: Errno::EBADF,
        };
        assert!(err.to_string().contains("42"));
        assert_eq!(err.as_label(), "ctx_invalid_descriptor");
    }
}
