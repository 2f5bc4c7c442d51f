//! # Supervisor: forks workers, polls health, applies refork decisions.
//!
//! The [`Supervisor`] owns the pool bookkeeping (one [`Worker`] record, one
//! [`ReforkCondition`] and one progress reader per slot), the shared
//! [`HealthSegment`], and the signal pipe. It runs a blocking poll/wait
//! loop: no async runtime, no background threads — anything like that in
//! the master would itself be fork-unsafe.
//!
//! ## High-level architecture
//! ```text
//! Inputs to run():
//!   serve callback  ──►  Supervisor::run(cfg, ctx)
//!
//! Boot:
//!   - HealthSegment::new(workers)        (before the first fork)
//!   - SignalPipe::install()              (TERM/INT/QUIT/CHLD → self-pipe)
//!   - fork one child per slot            (child: sweep fds, reset, serve)
//!
//! Each tick:
//!   ┌► drain progress pipes ──► Worker.requests_count (stale gens dropped)
//!   ├► reap exited children ──► unexpected deaths queued for respawn
//!   ├► respawn queued slots ──► promote(new_pid), arm deadline
//!   └► evaluate conditions  ──► met? ─► re-check fork safety ─► fork
//!                                │            │
//!                                │            └─ refused/failed:
//!                                │               report + condition.backoff()
//!                                └─ replacement forked:
//!                                   promote, arm deadline, SIGTERM old pid
//!
//! Shutdown path (SIGTERM / SIGINT / SIGQUIT):
//!   begin_shutdown() ──► SIGTERM all ──► wait up to grace
//!        ├─ all exited      → Ok(())
//!        └─ stragglers left → SIGKILL + Err(GraceExceeded { grace, stuck })
//! ```
//!
//! A fork, once it returns in the supervisor, cannot be rolled back; a
//! pending refork decision is therefore re-validated (condition + fork
//! safety) immediately before the fork is issued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::ProcessContext;
use crate::core::channel::{progress_pipe, ProgressFrame, ProgressReader};
use crate::core::child::{run_child, ServeError, WorkerContext};
use crate::core::signals::SignalPipe;
use crate::error::PoolError;
use crate::policies::{ReforkCondition, RequestsCount};
use crate::shm::HealthSegment;
use crate::worker::{Worker, WorkerState};

/// Builds the refork condition for a slot.
type ConditionFactory = Box<dyn Fn(usize) -> Box<dyn ReforkCondition>>;

/// Everything the supervisor tracks for one slot.
struct Slot {
    worker: Worker,
    condition: Box<dyn ReforkCondition>,
    reader: ProgressReader,
}

/// Coordinates a pool of forked worker processes.
pub struct Supervisor {
    cfg: Config,
    ctx: Arc<ProcessContext>,
    shm: Arc<HealthSegment>,
    slots: Vec<Slot>,
    /// Outgoing pids we retired and still expect to reap.
    draining: Vec<Pid>,
    /// Slots whose process died unexpectedly, awaiting a replacement fork.
    respawn: Vec<usize>,
    condition_factory: ConditionFactory,
}

impl Supervisor {
    /// Validates the configuration and maps the shared health segment.
    ///
    /// Must be constructed before anything else forks: the segment and the
    /// safety context have to exist prior to the first child.
    pub fn new(cfg: Config, ctx: Arc<ProcessContext>) -> Result<Self, PoolError> {
        if cfg.workers == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "workers must be at least 1".into(),
            });
        }
        if cfg.timeout.is_zero() {
            // Deadlines would be armed at `now + 0`, permanently excluding
            // every worker from the live count.
            return Err(PoolError::InvalidConfig {
                reason: "timeout must be positive".into(),
            });
        }
        let shm = Arc::new(HealthSegment::new(cfg.workers)?);
        let thresholds = cfg.refork_thresholds.clone();
        let backoff = cfg.backoff;
        let condition_factory: ConditionFactory =
            Box::new(move |_slot| Box::new(RequestsCount::new(thresholds.clone(), backoff)));
        Ok(Self {
            cfg,
            ctx,
            shm,
            slots: Vec::new(),
            draining: Vec::new(),
            respawn: Vec::new(),
            condition_factory,
        })
    }

    /// Replaces the per-slot refork condition factory (the default builds a
    /// [`RequestsCount`] ladder from the config).
    pub fn with_condition_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize) -> Box<dyn ReforkCondition> + 'static,
    {
        self.condition_factory = Box::new(factory);
        self
    }

    /// Handle to the shared segment, for external health-check
    /// collaborators.
    pub fn health(&self) -> Arc<HealthSegment> {
        Arc::clone(&self.shm)
    }

    /// True once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shm.is_shutting_down()
    }

    /// Count of slots whose deadline is strictly in the future.
    pub fn live_workers_count(&self, now: f64) -> usize {
        self.shm.live_workers_count(now)
    }

    /// Supervisor-side view of the worker records.
    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.slots.iter().map(|slot| &slot.worker)
    }

    /// Feeds an externally observed request total into the bookkeeping, for
    /// embedders using a reporting channel other than the built-in progress
    /// pipe. Reports for a slot that is not populated are ignored.
    pub fn observe_requests_count(&mut self, slot: usize, total: u64) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.worker.observe_requests_count(total);
        }
    }

    /// Forks the pool and supervises it until a termination signal arrives.
    ///
    /// `serve` runs in each child after the descriptor sweep; the child
    /// process exits with its outcome and never returns here. In the
    /// supervisor this method blocks until shutdown completes (or the drain
    /// overruns its grace window).
    pub fn run<F>(mut self, serve: F) -> Result<(), PoolError>
    where
        F: Fn(&mut WorkerContext) -> Result<(), ServeError>,
    {
        let signals = SignalPipe::install()?;

        for slot in 0..self.cfg.workers {
            let (pid, reader) = self.fork_worker(slot, 0, &serve)?;
            self.arm_deadline(slot);
            let condition = (self.condition_factory)(slot);
            self.slots.push(Slot {
                worker: Worker::new(slot, pid),
                condition,
                reader,
            });
            debug!(slot, pid = pid.as_raw(), "worker forked");
        }
        info!(workers = self.cfg.workers, "worker pool started");

        loop {
            let pending = signals.wait(self.cfg.tick_clamped())?;
            if pending
                .iter()
                .any(|s| matches!(s, Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT))
            {
                return self.drain();
            }
            // SIGCHLD just wakes the loop early; the tick always reaps.
            self.tick(&serve);
        }
    }

    /// One supervision pass: observe progress, reap, respawn, evaluate
    /// refork conditions. The supervisor's view of the pool is consistent
    /// only as of this poll; staleness bounded by the tick is by design.
    fn tick<F>(&mut self, serve: &F)
    where
        F: Fn(&mut WorkerContext) -> Result<(), ServeError>,
    {
        self.observe_progress();
        self.reap();
        self.respawn_dead(serve);
        self.evaluate_reforks(serve);
    }

    /// Drains every slot's progress pipe into its bookkeeping record.
    fn observe_progress(&mut self) {
        for slot in &mut self.slots {
            for frame in slot.reader.drain() {
                if apply_frame(&mut slot.worker, frame) {
                    continue;
                }
                debug!(
                    slot = slot.worker.slot(),
                    frame_generation = frame.generation,
                    current_generation = slot.worker.generation(),
                    "dropped stale progress frame"
                );
            }
        }
    }

    /// Collects exited children without blocking.
    fn reap(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    if let Some(pid) = status.pid() {
                        self.note_exit(pid, status);
                    }
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    warn!(%errno, "waitpid failed");
                    break;
                }
            }
        }
    }

    fn note_exit(&mut self, pid: Pid, status: WaitStatus) {
        if let Some(pos) = self.draining.iter().position(|&p| p == pid) {
            self.draining.swap_remove(pos);
            debug!(pid = pid.as_raw(), "retired worker exited");
            return;
        }
        let Some(idx) = self
            .slots
            .iter()
            .position(|slot| slot.worker.pid() == pid)
        else {
            debug!(pid = pid.as_raw(), "reaped unknown child");
            return;
        };
        warn!(
            slot = idx,
            pid = pid.as_raw(),
            ?status,
            "worker exited unexpectedly"
        );
        // Knock the slot out of the live count until the replacement
        // heartbeats, and out of refork evaluation until the respawn
        // promotes it: the reaped pid must not be promoted or signaled
        // again.
        self.shm.set_deadline(idx, 0.0);
        self.slots[idx].worker.set_state(WorkerState::Starting);
        self.respawn.push(idx);
    }

    /// Replaces slots whose process died. A failed fork stays queued and is
    /// retried next tick.
    fn respawn_dead<F>(&mut self, serve: &F)
    where
        F: Fn(&mut WorkerContext) -> Result<(), ServeError>,
    {
        let pending = std::mem::take(&mut self.respawn);
        for idx in pending {
            let generation = self.slots[idx].worker.generation() + 1;
            match self.fork_worker(idx, generation, serve) {
                Ok((pid, reader)) => {
                    self.arm_deadline(idx);
                    let slot = &mut self.slots[idx];
                    slot.worker.promote(pid);
                    slot.reader = reader;
                    info!(slot = idx, pid = pid.as_raw(), generation, "worker respawned");
                }
                Err(err) => {
                    error!(slot = idx, label = err.as_label(), %err, "respawn failed, will retry");
                    self.respawn.push(idx);
                }
            }
        }
    }

    /// Asks each serving slot's condition whether it qualifies, then acts.
    fn evaluate_reforks<F>(&mut self, serve: &F)
    where
        F: Fn(&mut WorkerContext) -> Result<(), ServeError>,
    {
        let mut pending = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.worker.state() == WorkerState::Serving && slot.condition.met(&slot.worker) {
                slot.worker.set_state(WorkerState::ReforkRequested);
                pending.push(idx);
            }
        }
        for idx in pending {
            self.refork(idx, serve);
        }
    }

    /// Forks the replacement for `idx`, promotes the record, and retires
    /// the outgoing process. Fork safety is re-checked immediately before
    /// the fork: the decision is withdrawn if the latch flipped since the
    /// condition was evaluated.
    fn refork<F>(&mut self, idx: usize, serve: &F)
    where
        F: Fn(&mut WorkerContext) -> Result<(), ServeError>,
    {
        let generation = self.slots[idx].worker.generation() + 1;
        match self.fork_worker(idx, generation, serve) {
            Ok((new_pid, reader)) => {
                self.arm_deadline(idx);
                let slot = &mut self.slots[idx];
                let old_pid = slot.worker.pid();
                slot.worker.promote(new_pid);
                // Old process keeps finishing in-flight work until SIGTERM
                // lands; the slot leaves Draining on the new generation's
                // first progress report.
                slot.worker.set_state(WorkerState::Draining);
                slot.reader = reader;
                self.draining.push(old_pid);
                match kill(old_pid, Signal::SIGTERM) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(errno) => warn!(pid = old_pid.as_raw(), %errno, "SIGTERM failed"),
                }
                info!(
                    slot = idx,
                    old_pid = old_pid.as_raw(),
                    new_pid = new_pid.as_raw(),
                    generation,
                    "worker reforked"
                );
            }
            Err(err @ PoolError::ForkUnsafe { .. }) => {
                warn!(slot = idx, label = err.as_label(), %err, "refork refused");
                let slot = &mut self.slots[idx];
                slot.condition.backoff();
                slot.worker.set_state(WorkerState::Serving);
            }
            Err(err) => {
                error!(slot = idx, label = err.as_label(), %err, "refork failed");
                let slot = &mut self.slots[idx];
                slot.condition.backoff();
                slot.worker.set_state(WorkerState::Serving);
            }
        }
    }

    /// Forks one child for `slot` at `generation`. In the child this never
    /// returns; in the supervisor it yields the child's pid and the
    /// supervisor-side end of the progress channel.
    fn fork_worker<F>(
        &self,
        slot: usize,
        generation: u64,
        serve: &F,
    ) -> Result<(Pid, ProgressReader), PoolError>
    where
        F: Fn(&mut WorkerContext) -> Result<(), ServeError>,
    {
        if !self.ctx.is_fork_safe() {
            return Err(PoolError::ForkUnsafe { slot });
        }
        let (reader, writer) = progress_pipe(slot)?;
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                // The child owns the write end; holding our copy open would
                // keep the pipe from ever reporting EOF.
                drop(writer);
                Ok((child, reader))
            }
            Ok(ForkResult::Child) => {
                drop(reader);
                let record = Worker::for_child(slot, getpid(), generation);
                let wc = WorkerContext::new(
                    record,
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.shm),
                    self.cfg.timeout,
                    writer,
                );
                run_child(wc, serve)
            }
            Err(errno) => Err(PoolError::ForkFailed { slot, errno }),
        }
    }

    fn arm_deadline(&self, slot: usize) {
        self.shm
            .set_deadline(slot, HealthSegment::now() + self.cfg.timeout.as_secs_f64());
    }

    /// Graceful-stop sequence: raise the shared flag, SIGTERM everything,
    /// wait up to `grace`, then SIGKILL the stragglers.
    fn drain(mut self) -> Result<(), PoolError> {
        info!("shutdown requested; draining workers");
        self.shm.begin_shutdown();

        let mut live = drain_targets(&self.slots, &self.respawn, &self.draining);
        self.draining.clear();
        for &pid in &live {
            match kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => warn!(pid = pid.as_raw(), %errno, "SIGTERM failed"),
            }
        }

        let deadline = Instant::now() + self.cfg.grace;
        loop {
            reap_into(&mut live);
            if live.is_empty() {
                info!("all workers stopped within grace");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }

        error!(stuck = ?live, "drain grace exceeded; escalating to SIGKILL");
        for &pid in &live {
            let _ = kill(pid, Signal::SIGKILL);
        }
        for &pid in &live {
            let _ = waitpid(pid, None);
        }
        Err(PoolError::GraceExceeded {
            grace: self.cfg.grace,
            stuck: live,
        })
    }
}

/// Pids the drain sequence must terminate: every populated slot plus the
/// retired processes still draining. A slot queued for respawn holds the
/// pid of an already-reaped process (possibly recycled by the kernel) and
/// must not be signaled or waited on again.
fn drain_targets(slots: &[Slot], respawn: &[usize], draining: &[Pid]) -> Vec<Pid> {
    slots
        .iter()
        .enumerate()
        .filter(|(idx, _)| !respawn.contains(idx))
        .map(|(_, slot)| slot.worker.pid())
        .chain(draining.iter().copied())
        .collect()
}

/// Applies one progress frame to a bookkeeping record. Returns false when
/// the frame belongs to an already-replaced generation.
fn apply_frame(worker: &mut Worker, frame: ProgressFrame) -> bool {
    if frame.generation != worker.generation() {
        return false;
    }
    worker.observe_requests_count(frame.requests_count);
    if worker.state() != WorkerState::Serving {
        // First report doubles as "the new process is serving".
        worker.set_state(WorkerState::Serving);
    }
    true
}

/// Non-blocking reap used by the drain loop; removes reaped pids from
/// `live`.
fn reap_into(live: &mut Vec<Pid>) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    live.retain(|&p| p != pid);
                } else {
                    break;
                }
            }
            Err(Errno::ECHILD) => {
                live.clear();
                break;
            }
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::BackoffPolicy;

    fn test_slot(idx: usize, pid: i32) -> Slot {
        let (reader, _writer) = progress_pipe(idx).unwrap();
        Slot {
            worker: Worker::new(idx, Pid::from_raw(pid)),
            condition: Box::new(RequestsCount::new(vec![], BackoffPolicy::Manual)),
            reader,
        }
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let cfg = Config {
            workers: 0,
            ..Config::default()
        };
        let err = Supervisor::new(cfg, Arc::new(ProcessContext::new())).err().unwrap();
        assert!(matches!(err, PoolError::InvalidConfig { .. }));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let cfg = Config {
            timeout: Duration::ZERO,
            ..Config::default()
        };
        let err = Supervisor::new(cfg, Arc::new(ProcessContext::new())).err().unwrap();
        assert!(matches!(err, PoolError::InvalidConfig { .. }));
    }

    #[test]
    fn test_health_surface_delegates_to_the_segment() {
        let cfg = Config {
            workers: 2,
            ..Config::default()
        };
        let sup = Supervisor::new(cfg, Arc::new(ProcessContext::new())).unwrap();
        assert!(!sup.is_shutting_down());
        assert_eq!(sup.live_workers_count(HealthSegment::now()), 0);

        let health = sup.health();
        health.set_deadline(1, HealthSegment::now() + 60.0);
        health.begin_shutdown();

        assert!(sup.is_shutting_down());
        assert_eq!(sup.live_workers_count(HealthSegment::now()), 1);
    }

    #[test]
    fn test_current_generation_frame_is_applied() {
        let mut worker = Worker::new(0, Pid::from_raw(42));
        let applied = apply_frame(
            &mut worker,
            ProgressFrame {
                generation: 0,
                requests_count: 31,
            },
        );
        assert!(applied);
        assert_eq!(worker.requests_count(), 31);
        assert_eq!(worker.state(), WorkerState::Serving);
    }

    #[test]
    fn test_first_report_of_new_generation_ends_draining() {
        let mut worker = Worker::new(0, Pid::from_raw(42));
        worker.promote(Pid::from_raw(43));
        worker.set_state(WorkerState::Draining);
        let applied = apply_frame(
            &mut worker,
            ProgressFrame {
                generation: 1,
                requests_count: 0,
            },
        );
        assert!(applied);
        assert_eq!(worker.state(), WorkerState::Serving);
    }

    #[test]
    fn test_stale_generation_frame_is_dropped() {
        let mut worker = Worker::new(0, Pid::from_raw(42));
        worker.promote(Pid::from_raw(43));
        let applied = apply_frame(
            &mut worker,
            ProgressFrame {
                generation: 0,
                requests_count: 500,
            },
        );
        assert!(!applied);
        assert_eq!(worker.requests_count(), 0);
    }

    #[test]
    fn test_unexpected_exit_parks_the_slot_until_respawn() {
        let cfg = Config {
            workers: 2,
            ..Config::default()
        };
        let mut sup = Supervisor::new(cfg, Arc::new(ProcessContext::new())).unwrap();
        sup.slots.push(test_slot(0, 100));
        sup.slots.push(test_slot(1, 101));
        sup.slots[1].worker.set_state(WorkerState::Serving);
        sup.shm.set_deadline(1, HealthSegment::now() + 60.0);

        let dead = Pid::from_raw(101);
        sup.note_exit(dead, WaitStatus::Exited(dead, 1));

        // Out of refork evaluation, out of the live count, queued for a
        // replacement fork.
        assert_eq!(sup.slots[1].worker.state(), WorkerState::Starting);
        assert_eq!(sup.shm.deadline(1), 0.0);
        assert_eq!(sup.respawn, vec![1]);
    }

    #[test]
    fn test_retired_pid_exit_is_not_a_respawn() {
        let cfg = Config {
            workers: 1,
            ..Config::default()
        };
        let mut sup = Supervisor::new(cfg, Arc::new(ProcessContext::new())).unwrap();
        sup.slots.push(test_slot(0, 100));
        let retired = Pid::from_raw(99);
        sup.draining.push(retired);

        sup.note_exit(retired, WaitStatus::Exited(retired, 0));

        assert!(sup.draining.is_empty());
        assert!(sup.respawn.is_empty());
        assert_eq!(sup.slots[0].worker.state(), WorkerState::Starting);
    }

    #[test]
    fn test_drain_targets_skip_respawn_pending_slots() {
        let slots = vec![test_slot(0, 100), test_slot(1, 101), test_slot(2, 102)];
        let retired = Pid::from_raw(99);

        // Slot 1's process is already reaped and awaits a replacement fork;
        // its recorded pid must never be signaled again.
        let targets = drain_targets(&slots, &[1], &[retired]);
        assert_eq!(
            targets,
            vec![Pid::from_raw(100), Pid::from_raw(102), retired]
        );

        let targets = drain_targets(&slots, &[], &[]);
        assert_eq!(targets.len(), 3);
    }
}
