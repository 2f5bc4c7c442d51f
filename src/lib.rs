//! # forkvisor
//!
//! **Forkvisor** is the process-supervision core of a prefork server: a
//! master process owns a pool of forked workers, tracks their liveness
//! through a lock-free shared-memory health channel, and decides — via a
//! pluggable policy — when to replace ("refork") a worker with a fresh
//! copy-on-write clone of the master to reclaim memory and refresh shared
//! pages.
//!
//! It coordinates independent OS processes without a shared heap: monotonic
//! generations, debounced trigger conditions, and a descriptor sweep that
//! must never corrupt a child's fd table across a fork. The hosted
//! application, wire protocol, CLI, and logging setup are the embedder's.
//!
//! ## Architecture
//! ```text
//!  ┌────────────────────────────────────────────────────────────────┐
//!  │  Supervisor (master process)                                   │
//!  │  - Worker records   (slot, pid, generation, requests_count)    │
//!  │  - ReforkCondition  (per slot: threshold ladder + backoff)     │
//!  │  - ProcessContext   (fork-safety latch, kept descriptors)      │
//!  │  - SignalPipe       (TERM/INT/QUIT/CHLD → blocking poll loop)  │
//!  └─────┬──────────────────┬──────────────────┬────────────────────┘
//!        │ fork()           │ fork()           │ fork()
//!        ▼                  ▼                  ▼
//!   ┌──────────┐       ┌──────────┐       ┌──────────┐
//!   │ worker 0 │       │ worker 1 │       │ worker 2 │
//!   │ sweep fds│       │          │       │          │
//!   │ serve    │       │          │       │          │
//!   └────┬─────┘       └────┬─────┘       └────┬─────┘
//!        │ deadline          │                  │    progress frames
//!        ▼                   ▼                  ▼    (gen, requests)
//!  ┌────────────────────────────────────────────────────────────────┐
//!  │  HealthSegment (anonymous MAP_SHARED, created before 1st fork) │
//!  │  [ slot deadlines ... | shutdown flag ]                        │
//!  └────────────────────────────────────────────────────────────────┘
//!        ▲ liveness + shutdown, readable from any process
//! ```
//!
//! ## Lifecycle of a slot
//! ```text
//! fork ─► sweep inherited fds ─► reset ─► serving
//!   ▲                                       │ requests_count climbs
//!   │                                       ▼
//!   │        condition met? ── backoff? ── fork-safe?
//!   │                │                        │
//!   │                └─ no: keep serving      └─ no: refuse + report
//!   └── promote(new_pid), generation += 1, SIGTERM the old process
//! ```
//!
//! | Area            | Description                                         | Key types                              |
//! |-----------------|-----------------------------------------------------|----------------------------------------|
//! | **Supervision** | Fork, promote, respawn, drain a pool of workers.    | [`Supervisor`], [`Config`]             |
//! | **Liveness**    | Lock-free shared deadlines + global shutdown flag.  | [`HealthSegment`]                      |
//! | **Policies**    | When a worker qualifies for replacement.            | [`ReforkCondition`], [`RequestsCount`] |
//! | **Debounce**    | Suppression after refused/failed refork attempts.   | [`BackoffPolicy`], [`JitterPolicy`]    |
//! | **Fork safety** | One-way latch + kept-descriptor registry.           | [`ProcessContext`]                     |
//! | **Errors**      | Typed errors with stable log labels.                | [`PoolError`], [`ContextError`]        |
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use forkvisor::{Config, ProcessContext, Supervisor};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = Config::default();
//!     cfg.workers = 4;
//!     cfg.refork_thresholds = vec![Some(1_000), Some(10_000), None];
//!
//!     // Created once at boot, before the first fork.
//!     let ctx = Arc::new(ProcessContext::new());
//!     let supervisor = Supervisor::new(cfg, Arc::clone(&ctx))?;
//!
//!     supervisor.run(|worker| {
//!         // The hosted serving loop goes here (accept, handle, ...).
//!         while !worker.is_shutting_down() {
//!             // ... handle one request ...
//!             worker.complete_requests(1);
//!         }
//!         Ok(())
//!     })?;
//!     Ok(())
//! }
//! ```

mod config;
mod context;
mod core;
mod error;
mod policies;
mod shm;
mod worker;

// ---- Public re-exports ----

pub use config::Config;
pub use context::ProcessContext;
pub use core::{ServeError, Supervisor, WorkerContext};
pub use error::{ContextError, PoolError};
pub use policies::{BackoffPolicy, BackoffState, JitterPolicy, ReforkCondition, RequestsCount};
pub use shm::HealthSegment;
pub use worker::{Worker, WorkerState};
