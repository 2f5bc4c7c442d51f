//! Runtime core: forking, supervision, and the child-side runtime.
//!
//! Internal modules:
//! - [`supervisor`]: pool bookkeeping, fork/refork, tick loop, drain;
//! - [`child`]: post-fork child setup and the worker-facing context;
//! - [`channel`]: per-slot worker → supervisor progress pipe;
//! - [`signals`]: self-pipe wiring for the blocking supervisor loop.

mod channel;
mod child;
mod signals;
mod supervisor;

pub use child::{ServeError, WorkerContext};
pub use supervisor::Supervisor;
