//! # Process-wide safety context: fork-safety latch + descriptor hygiene.
//!
//! [`ProcessContext`] holds the only two pieces of process-wide mutable state
//! in the crate:
//!
//! - a one-way **fork-unsafe latch**: once some component does something that
//!   cannot survive a fork correctly (spawns background threads, opens native
//!   handles with thread affinity), it calls
//!   [`ProcessContext::mark_fork_unsafe`] and every later refork attempt is
//!   refused and reported;
//! - a **kept-descriptor registry**: collaborators that own a descriptor
//!   which must survive the post-fork sweep in a child (listening sockets,
//!   control pipes) register it before that child's fork.
//!
//! The context is created once at process start and passed explicitly to the
//! supervisor and anything else that needs it; it is never shared across a
//! fork boundary by reference — each forked child gets its own copy of the
//! latch value and registry contents at fork time.
//!
//! The registry tracks stable raw descriptor ids with explicit removal on
//! close ([`ProcessContext::release_descriptor`]); there is no automatic
//! expiry.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::socket::{getsockopt, sockopt, SockType};
use nix::sys::stat::{fstat, SFlag};
use nix::unistd::{close, dup2};
use tracing::{debug, warn};

use crate::error::ContextError;

/// The three standard streams, never touched by the sweep.
const STD_STREAMS: [RawFd; 3] = [0, 1, 2];

/// Process-wide fork-safety latch and kept-descriptor registry.
pub struct ProcessContext {
    fork_safe: AtomicBool,
    kept: Mutex<HashSet<RawFd>>,
    no_auto_close: Mutex<HashSet<RawFd>>,
}

impl ProcessContext {
    /// Creates a fresh context: fork-safe, empty registry.
    pub fn new() -> Self {
        Self {
            fork_safe: AtomicBool::new(true),
            kept: Mutex::new(HashSet::new()),
            no_auto_close: Mutex::new(HashSet::new()),
        }
    }

    fn kept_set(&self) -> MutexGuard<'_, HashSet<RawFd>> {
        self.kept.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn no_auto_close_set(&self) -> MutexGuard<'_, HashSet<RawFd>> {
        self.no_auto_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `fd` as must-survive the post-fork sweep.
    ///
    /// Fails immediately with [`ContextError::InvalidDescriptor`] when `fd`
    /// cannot be resolved to a live descriptor — that is a programming
    /// error, not a retryable condition.
    pub fn register_kept_descriptor(&self, fd: RawFd) -> Result<(), ContextError> {
        fcntl(fd, FcntlArg::F_GETFD)
            .map_err(|errno| ContextError::InvalidDescriptor { fd, errno })?;
        self.kept_set().insert(fd);
        Ok(())
    }

    /// Batch form of [`register_kept_descriptor`](Self::register_kept_descriptor);
    /// stops at the first invalid handle.
    pub fn register_kept_descriptors(&self, fds: &[RawFd]) -> Result<(), ContextError> {
        for &fd in fds {
            self.register_kept_descriptor(fd)?;
        }
        Ok(())
    }

    /// Removes `fd` from the kept registry. Call when the owning
    /// collaborator closes the descriptor; the registry has no automatic
    /// expiry.
    pub fn release_descriptor(&self, fd: RawFd) {
        self.kept_set().remove(&fd);
    }

    /// Returns true if `fd` is currently registered as kept.
    pub fn is_kept(&self, fd: RawFd) -> bool {
        self.kept_set().contains(&fd)
    }

    /// Marks `fd` as not subject to automatic closing by the sweep, without
    /// requiring it to be resolvable right now. Distinct from the kept
    /// registry: this expresses "owned and closed elsewhere".
    pub fn mark_no_auto_close(&self, fd: RawFd) {
        self.no_auto_close_set().insert(fd);
    }

    /// Flips the fork-safety latch. One-way: there is no path back to
    /// fork-safe for the life of the process.
    pub fn mark_fork_unsafe(&self) {
        self.fork_safe.store(false, Ordering::Release);
    }

    /// Returns true while the process may still fork safely. Consulted by
    /// the supervisor before every replacement fork.
    pub fn is_fork_safe(&self) -> bool {
        self.fork_safe.load(Ordering::Acquire)
    }

    /// Closes every inherited descriptor a freshly forked worker must not
    /// keep. Invoked exactly once per child, before it begins serving.
    ///
    /// Skipped: the three standard streams, every registered kept
    /// descriptor, and every descriptor marked non-auto-closing. A stream
    /// socket candidate is first redirected to `/dev/null` so the close
    /// emits no FIN/RST toward a remote peer that may legitimately belong
    /// to a different worker sharing the inherited descriptor table.
    ///
    /// "Already closed" (`EBADF`) is expected under a close race and is
    /// swallowed. Returns the number of descriptors closed.
    pub fn close_inherited_descriptors(&self) -> Result<usize, ContextError> {
        let open = list_open_fds()?;
        let kept = self.kept_set().clone();
        let no_auto = self.no_auto_close_set().clone();
        let candidates = sweep_candidates(&open, &kept, &no_auto);

        let mut closed = 0;
        for fd in candidates {
            if is_stream_socket(fd) {
                redirect_to_null(fd);
            }
            match close(fd) {
                Ok(()) => closed += 1,
                // Expected race with a concurrent close elsewhere
                // (including the /proc enumeration handle itself).
                Err(Errno::EBADF) => {}
                Err(errno) => {
                    warn!(fd, %errno, "failed to close inherited descriptor");
                }
            }
        }
        debug!(closed, "swept inherited descriptors");
        Ok(closed)
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerates every descriptor currently open in this process.
///
/// The enumeration handle's own fd ends up in the returned list, but it is
/// closed when the iterator is dropped, so the sweep's later `close` on it
/// lands on `EBADF` and is swallowed.
fn list_open_fds() -> Result<Vec<RawFd>, ContextError> {
    let mut fds = Vec::new();
    for entry in std::fs::read_dir("/proc/self/fd")? {
        let entry = entry?;
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
            fds.push(fd);
        }
    }
    Ok(fds)
}

/// Pure selection step of the sweep: everything open minus the standard
/// streams, the kept set, and the non-auto-closing set.
fn sweep_candidates(
    open: &[RawFd],
    kept: &HashSet<RawFd>,
    no_auto_close: &HashSet<RawFd>,
) -> Vec<RawFd> {
    open.iter()
        .copied()
        .filter(|fd| !STD_STREAMS.contains(fd))
        .filter(|fd| !kept.contains(fd))
        .filter(|fd| !no_auto_close.contains(fd))
        .collect()
}

/// Returns true if `fd` is a connection-oriented (stream) socket.
fn is_stream_socket(fd: RawFd) -> bool {
    let is_socket = match fstat(fd) {
        Ok(st) => SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits()) == SFlag::S_IFSOCK,
        Err(_) => false,
    };
    if !is_socket {
        return false;
    }
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    matches!(getsockopt(&borrowed, sockopt::SockType), Ok(SockType::Stream))
}

/// Points `fd` at `/dev/null` so the subsequent close cannot signal a peer.
fn redirect_to_null(fd: RawFd) {
    let null = match OpenOptions::new().read(true).write(true).open("/dev/null") {
        Ok(file) => file,
        Err(err) => {
            warn!(fd, %err, "cannot open /dev/null to neutralize socket");
            return;
        }
    };
    if let Err(errno) = dup2(null.as_raw_fd(), fd) {
        warn!(fd, %errno, "dup2 to /dev/null failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fork_safety_latch_is_one_way() {
        let ctx = ProcessContext::new();
        assert!(ctx.is_fork_safe());
        ctx.mark_fork_unsafe();
        assert!(!ctx.is_fork_safe());
        // Nothing flips it back.
        ctx.mark_fork_unsafe();
        assert!(!ctx.is_fork_safe());
    }

    #[test]
    fn test_register_live_descriptor() {
        let ctx = ProcessContext::new();
        let mut file = tempfile::tempfile().unwrap();
        writeln!(file, "keep me").unwrap();
        let fd = file.as_raw_fd();

        ctx.register_kept_descriptor(fd).unwrap();
        assert!(ctx.is_kept(fd));

        ctx.release_descriptor(fd);
        assert!(!ctx.is_kept(fd));
    }

    #[test]
    fn test_register_invalid_descriptor_fails() {
        let ctx = ProcessContext::new();
        let err = ctx.register_kept_descriptor(-1).unwrap_err();
        assert!(matches!(
            err,
            ContextError::InvalidDescriptor { fd: -1, .. }
        ));
        let err = ctx.register_kept_descriptor(1_000_000).unwrap_err();
        assert!(matches!(err, ContextError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_batch_registration_stops_at_first_invalid() {
        let ctx = ProcessContext::new();
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();

        assert!(ctx.register_kept_descriptors(&[fd, -1]).is_err());
        // The valid prefix was registered before the failure.
        assert!(ctx.is_kept(fd));
        assert!(!ctx.is_kept(-1));
    }

    #[test]
    fn test_sweep_never_selects_standard_streams() {
        let open = vec![0, 1, 2, 5, 9];
        let candidates = sweep_candidates(&open, &HashSet::new(), &HashSet::new());
        assert_eq!(candidates, vec![5, 9]);
    }

    #[test]
    fn test_sweep_skips_kept_and_non_auto_closing() {
        let open = vec![0, 1, 2, 4, 5, 6, 7];
        let kept: HashSet<RawFd> = [5].into_iter().collect();
        let no_auto: HashSet<RawFd> = [7].into_iter().collect();
        let candidates = sweep_candidates(&open, &kept, &no_auto);
        assert_eq!(candidates, vec![4, 6]);
    }

    #[test]
    fn test_sweep_with_everything_protected_is_empty() {
        let open = vec![0, 1, 2, 3, 4];
        let kept: HashSet<RawFd> = [3].into_iter().collect();
        let no_auto: HashSet<RawFd> = [4].into_iter().collect();
        assert!(sweep_candidates(&open, &kept, &no_auto).is_empty());
    }

    #[test]
    fn test_regular_file_is_not_a_stream_socket() {
        let file = tempfile::tempfile().unwrap();
        assert!(!is_stream_socket(file.as_raw_fd()));
        assert!(!is_stream_socket(-1));
    }

    #[test]
    fn test_stream_socket_is_detected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(is_stream_socket(listener.as_raw_fd()));
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(!is_stream_socket(udp.as_raw_fd()));
    }
}
