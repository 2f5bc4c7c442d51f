//! Child-side runtime: what happens between `fork(2)` and the serve loop.
//!
//! A freshly forked worker, before it accepts any traffic:
//!
//! 1. restores default signal dispositions and detaches from the
//!    supervisor's self-pipe;
//! 2. registers its own progress-pipe end as kept, then sweeps every other
//!    inherited descriptor ([`ProcessContext::close_inherited_descriptors`]);
//! 3. arms its health deadline, resets its request count, and reports the
//!    fresh total so the supervisor sees the reset;
//! 4. enters the embedder's serve callback. It never returns to the
//!    supervisor's code: the process exits with the callback's outcome.
//!
//! [`ProcessContext::close_inherited_descriptors`]: crate::ProcessContext::close_inherited_descriptors

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::context::ProcessContext;
use crate::core::channel::{ProgressFrame, ProgressWriter};
use crate::core::signals;
use crate::shm::HealthSegment;
use crate::worker::{Worker, WorkerState};

/// Error type returned by the embedder's serve callback.
pub type ServeError = Box<dyn std::error::Error + Send + Sync>;

/// A worker's view of the pool: its own record (authoritative
/// `requests_count`), the shared health segment, and the progress channel
/// back to the supervisor.
///
/// This core's operations are all synchronous and non-blocking; the only
/// blocking a worker does lives in its own serving loop.
pub struct WorkerContext {
    worker: Worker,
    ctx: Arc<ProcessContext>,
    shm: Arc<HealthSegment>,
    timeout: Duration,
    writer: ProgressWriter,
}

impl WorkerContext {
    pub(crate) fn new(
        worker: Worker,
        ctx: Arc<ProcessContext>,
        shm: Arc<HealthSegment>,
        timeout: Duration,
        writer: ProgressWriter,
    ) -> Self {
        Self {
            worker,
            ctx,
            shm,
            timeout,
            writer,
        }
    }

    /// This worker's slot index.
    #[inline]
    pub fn slot(&self) -> usize {
        self.worker.slot()
    }

    /// This worker's generation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.worker.generation()
    }

    /// Units of work completed by this process so far.
    #[inline]
    pub fn requests_count(&self) -> u64 {
        self.worker.requests_count()
    }

    /// The process-wide safety context (this child's own copy).
    #[inline]
    pub fn context(&self) -> &ProcessContext {
        &self.ctx
    }

    /// True once the supervisor has begun shutdown. Serving loops should
    /// finish in-flight work and exit.
    pub fn is_shutting_down(&self) -> bool {
        self.shm.is_shutting_down()
    }

    /// Pushes this worker's deadline to `now + timeout`. Call on the
    /// heartbeat cadence, typically around request completion; missing the
    /// cadence for longer than the timeout makes the supervisor treat the
    /// worker as hung.
    pub fn heartbeat(&self) {
        self.shm
            .set_deadline(self.worker.slot(), HealthSegment::now() + self.timeout.as_secs_f64());
    }

    /// Adds `n` completed units of work to the local count.
    pub fn increment_requests_count(&mut self, n: u64) {
        self.worker.increment_requests_count(n);
    }

    /// Reports the current (generation, count) to the supervisor.
    /// Best-effort and non-blocking.
    pub fn report(&self) {
        self.writer.send(ProgressFrame {
            generation: self.worker.generation(),
            requests_count: self.worker.requests_count(),
        });
    }

    /// Convenience for the per-request tail: count `n` units, refresh the
    /// deadline, report progress.
    pub fn complete_requests(&mut self, n: u64) {
        self.increment_requests_count(n);
        self.heartbeat();
        self.report();
    }
}

/// Runs the child side to completion. Never returns.
pub(crate) fn run_child<F>(mut wc: WorkerContext, serve: &F) -> !
where
    F: Fn(&mut WorkerContext) -> Result<(), ServeError>,
{
    signals::reset_in_child();

    // The progress pipe must survive the sweep; everything else inherited
    // from the supervisor (other workers' pipes, the signal pipe, listening
    // sockets nobody registered) goes.
    if let Err(err) = wc.ctx.register_kept_descriptor(wc.writer.raw_fd()) {
        error!(slot = wc.slot(), %err, "cannot keep progress channel");
        std::process::exit(1);
    }
    if let Err(err) = wc.ctx.close_inherited_descriptors() {
        warn!(slot = wc.slot(), %err, "descriptor sweep incomplete");
    }

    // Promotion was recorded by the supervisor; the reset is ours. Report
    // the zeroed total so the supervisor's bookkeeping converges.
    wc.worker.reset();
    wc.worker.set_state(WorkerState::Serving);
    wc.heartbeat();
    wc.report();

    match serve(&mut wc) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!(slot = wc.slot(), generation = wc.generation(), %err, "worker failed");
            std::process::exit(1);
        }
    }
}
