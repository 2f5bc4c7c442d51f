//! Worker → supervisor progress channel.
//!
//! `requests_count` is authoritative in the worker process and is never
//! mutated remotely; the supervisor only observes it. The observation
//! channel is one nonblocking pipe per slot carrying fixed 16-byte frames:
//!
//! ```text
//! ┌────────────────────┬────────────────────┐
//! │ generation (u64 LE)│ requests (u64 LE)  │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! Frames are at most `PIPE_BUF` bytes, so writes are atomic. Frames carry
//! totals rather than deltas, which makes a dropped frame (full pipe)
//! harmless: the next one supersedes it. The generation lets the supervisor
//! discard reports that raced with a promotion.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tracing::debug;

use crate::error::PoolError;

/// Frame size on the wire.
const FRAME_LEN: usize = 16;

/// One progress report: the reporting generation and its running total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ProgressFrame {
    pub(crate) generation: u64,
    pub(crate) requests_count: u64,
}

impl ProgressFrame {
    fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[..8].copy_from_slice(&self.generation.to_le_bytes());
        buf[8..].copy_from_slice(&self.requests_count.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let mut generation = [0u8; 8];
        let mut req = [0u8; 8];
        generation.copy_from_slice(&buf[..8]);
        req.copy_from_slice(&buf[8..FRAME_LEN]);
        Self {
            generation: u64::from_le_bytes(generation),
            requests_count: u64::from_le_bytes(req),
        }
    }
}

/// Creates the per-slot pipe, nonblocking on both ends. Built in the
/// supervisor before the fork; the child inherits the write end.
pub(crate) fn progress_pipe(slot: usize) -> Result<(ProgressReader, ProgressWriter), PoolError> {
    let (read, write) =
        pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(|errno| PoolError::Channel { slot, errno })?;
    Ok((
        ProgressReader {
            file: File::from(read),
            pending: Vec::new(),
        },
        ProgressWriter {
            file: File::from(write),
        },
    ))
}

/// Supervisor-side read end.
pub(crate) struct ProgressReader {
    file: File,
    /// Bytes of a frame read so far; writes are atomic but a read can still
    /// split a frame, so leftovers carry over to the next drain.
    pending: Vec<u8>,
}

impl ProgressReader {
    /// Reads everything currently buffered in the pipe and returns the
    /// complete frames, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<ProgressFrame> {
        let mut buf = [0u8; 256];
        loop {
            match (&self.file).read(&mut buf) {
                Ok(0) => break, // writer closed
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(%err, "progress channel read failed, treating as closed");
                    break;
                }
            }
        }

        let complete = self.pending.len() / FRAME_LEN;
        let mut frames = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(FRAME_LEN) {
            frames.push(ProgressFrame::decode(chunk));
        }
        self.pending.drain(..complete * FRAME_LEN);
        frames
    }
}

/// Worker-side write end.
pub(crate) struct ProgressWriter {
    file: File,
}

impl ProgressWriter {
    /// Raw fd, for registering the write end as kept before the child's
    /// descriptor sweep.
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Sends one frame, best-effort: a full pipe or a vanished reader drops
    /// the report, and the next total supersedes it.
    pub(crate) fn send(&self, frame: ProgressFrame) {
        match (&self.file).write(&frame.encode()) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
            Err(err) => debug!(%err, "progress report dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_roundtrip_through_a_real_pipe() {
        let (mut reader, writer) = progress_pipe(0).unwrap();

        writer.send(ProgressFrame {
            generation: 0,
            requests_count: 7,
        });
        writer.send(ProgressFrame {
            generation: 0,
            requests_count: 12,
        });

        let frames = reader.drain();
        assert_eq!(
            frames,
            vec![
                ProgressFrame {
                    generation: 0,
                    requests_count: 7
                },
                ProgressFrame {
                    generation: 0,
                    requests_count: 12
                },
            ]
        );
    }

    #[test]
    fn test_drain_on_empty_pipe_is_empty() {
        let (mut reader, _writer) = progress_pipe(0).unwrap();
        assert!(reader.drain().is_empty());
    }

    #[test]
    fn test_split_frame_carries_over_between_drains() {
        let (mut reader, writer) = progress_pipe(0).unwrap();
        let bytes = ProgressFrame {
            generation: 3,
            requests_count: 99,
        }
        .encode();

        // Feed the frame in two halves, draining in between.
        (&writer.file).write_all(&bytes[..10]).unwrap();
        assert!(reader.drain().is_empty());

        (&writer.file).write_all(&bytes[10..]).unwrap();
        let frames = reader.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].generation, 3);
        assert_eq!(frames[0].requests_count, 99);
    }
}
