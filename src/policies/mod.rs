//! Refork decision policies.
//!
//! This module groups the knobs that control **whether** a worker is
//! replaced and **how** a refused attempt is debounced.
//!
//! ## Contents
//! - [`ReforkCondition`] — pluggable qualification predicate
//! - [`RequestsCount`] — built-in request-count threshold ladder
//! - [`BackoffPolicy`] / [`BackoffState`] — suppression after a refused or
//!   failed attempt (manual clear, or an auto-expiring cooldown)
//! - [`JitterPolicy`] — randomization of cooldown windows
//!
//! ## Quick wiring
//! ```text
//! Config { refork_thresholds, backoff }
//!      └─► Supervisor builds one RequestsCount per slot
//!           - met(&worker) each tick decides replace / keep
//!           - backoff() after a refused or failed fork
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → 10s cooldown, no jitter.
//! - An empty threshold ladder disables reforking entirely.

mod backoff;
mod refork;

pub use backoff::{BackoffPolicy, BackoffState, JitterPolicy};
pub use refork::{ReforkCondition, RequestsCount};
