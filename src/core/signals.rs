//! Self-pipe signal wiring for the supervisor loop.
//!
//! The supervisor runs a blocking poll/wait loop, so termination signals and
//! SIGCHLD are forwarded from the (async-signal-safe) handler into a
//! nonblocking pipe the loop polls with its tick timeout. The handler only
//! ever performs a single `write(2)` of the signal number.
//!
//! ## Signals
//! - `SIGTERM` / `SIGINT` / `SIGQUIT` — begin shutdown + drain
//! - `SIGCHLD` — wake the reap path

use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;

use crate::error::PoolError;

/// Signals the pipe forwards.
const FORWARDED: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGCHLD,
];

/// Write end of the self-pipe, visible to the handler. `-1` while no pipe
/// is installed (including in freshly forked children after the reset).
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // write(2) is async-signal-safe; a full pipe just drops the byte,
        // which is fine because pending signals are drained in batches.
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

/// Installed self-pipe plus the handlers feeding it.
pub(crate) struct SignalPipe {
    read: std::fs::File,
    _write: OwnedFd,
}

impl SignalPipe {
    /// Creates the pipe and installs handlers for the forwarded signals.
    pub(crate) fn install() -> Result<Self, PoolError> {
        let (read, write) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(|errno| PoolError::Signals { errno })?;
        SIGNAL_WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in FORWARDED {
            unsafe { sigaction(sig, &action) }.map_err(|errno| PoolError::Signals { errno })?;
        }
        Ok(Self {
            read: std::fs::File::from(read),
            _write: write,
        })
    }

    /// Blocks for up to `timeout`, then drains and returns every pending
    /// forwarded signal (possibly none, on a plain tick).
    pub(crate) fn wait(&self, timeout: Duration) -> Result<Vec<Signal>, PoolError> {
        let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(_) => {}
            // A signal interrupting the poll is itself the wake-up.
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(PoolError::Signals { errno }),
        }
        self.drain()
    }

    fn drain(&self) -> Result<Vec<Signal>, PoolError> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        if let Ok(sig) = Signal::try_from(libc::c_int::from(byte)) {
                            signals.push(sig);
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    let errno = Errno::from_raw(err.raw_os_error().unwrap_or(0));
                    return Err(PoolError::Signals { errno });
                }
            }
        }
        Ok(signals)
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        SIGNAL_WRITE_FD.store(-1, Ordering::Relaxed);
    }
}

/// Restores default dispositions in a freshly forked child and detaches the
/// handler from the inherited pipe fd before the descriptor sweep closes it.
pub(crate) fn reset_in_child() {
    SIGNAL_WRITE_FD.store(-1, Ordering::Relaxed);
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in FORWARDED {
        // Best effort: a child that keeps a stray handler still works, it
        // just cannot be terminated by the default disposition.
        let _ = unsafe { sigaction(sig, &action) };
    }
}
