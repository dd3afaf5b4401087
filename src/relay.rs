//! Shared byte pump: one page of data in flight at a time.
//!
//! Each event loop owns a single [`ReplayBuffer`]. Every successful read
//! lands in it, every drain writes it out in full, and because the storage
//! is reused the buffer doubles as the replay slot: whatever was read most
//! recently is exactly what a late-joining client gets on accept. A
//! zero-length read leaves the slot untouched so the next attacher still
//! sees the most recent bytes.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::unistd;

use crate::fdpass;

/// One page: big enough for a prompt and the last line of output,
/// small enough that replay stays a single chunk.
pub const BUF_CAPACITY: usize = 4096;

/// Result of draining the slot into a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Bytes written (0 when there was no destination or the slot is empty).
    Written(usize),
    /// The peer closed the connection (EPIPE). Not an error; the loop
    /// notices the dead descriptor through poll.
    PeerClosed,
}

/// What one `copy_a_bit` pass accomplished.
#[derive(Debug, Clone, Copy)]
pub struct CopyOutcome {
    /// Bytes read from the source; 0 means EOF.
    pub read: usize,
    /// Bytes actually written to the destination.
    pub written: usize,
}

pub struct ReplayBuffer {
    buf: [u8; BUF_CAPACITY],
    len: usize,
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0; BUF_CAPACITY],
            len: 0,
        }
    }

    /// The most recent successfully read chunk.
    pub fn last_read(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Read up to one page from `in_fd` into the slot.
    ///
    /// With `want_fd`, the read goes through `recvmsg` and an SCM_RIGHTS
    /// descriptor, if one arrives, is stored there — the caller decides when
    /// to stop asking. A positive read overwrites the slot and tees the new
    /// bytes to `dribble` when present; 0 (EOF) leaves the slot intact.
    pub fn fill_from(
        &mut self,
        in_fd: RawFd,
        dribble: Option<RawFd>,
        want_fd: Option<&mut Option<OwnedFd>>,
    ) -> io::Result<usize> {
        let n = match want_fd {
            Some(slot) => loop {
                match fdpass::recv_with_fd(in_fd, &mut self.buf) {
                    Ok((n, fd)) => {
                        if fd.is_some() {
                            *slot = fd;
                        }
                        break n;
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(e) => return Err(e),
                }
            },
            None => loop {
                match unistd::read(in_fd, &mut self.buf) {
                    Ok(n) => break n,
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
                }
            },
        };

        if n > 0 {
            self.len = n;
            if let Some(fd) = dribble {
                // Transcript tap is best effort.
                let _ = write_all(fd, &self.buf[..n]);
            }
        }
        Ok(n)
    }

    /// Write the whole slot to `out_fd`, looping over short writes.
    ///
    /// With `send_fd`, the first byte goes out via sendmsg with the
    /// descriptor attached; the remainder follows as plain bytes. EPIPE is
    /// reported as [`DrainStatus::PeerClosed`] rather than an error.
    pub fn drain_to(&self, out_fd: Option<RawFd>, send_fd: Option<RawFd>) -> io::Result<DrainStatus> {
        let out_fd = match out_fd {
            Some(fd) if self.len > 0 => fd,
            _ => return Ok(DrainStatus::Written(0)),
        };

        let mut offset = 0;
        if let Some(fd) = send_fd {
            match fdpass::send_with_fd(out_fd, &self.buf[..1], fd) {
                Ok(_) => offset = 1,
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
                    return Ok(DrainStatus::PeerClosed)
                }
                // Couldn't attach the descriptor; fall back to plain bytes.
                Err(_) => {}
            }
        }

        match write_all(out_fd, &self.buf[offset..self.len]) {
            Ok(()) => Ok(DrainStatus::Written(self.len)),
            Err(e) if e.raw_os_error() == Some(libc::EPIPE) => Ok(DrainStatus::PeerClosed),
            Err(e) => Err(e),
        }
    }

    /// One fill followed by one drain.
    ///
    /// `read == 0` signals EOF on the source. `written` says whether the
    /// destination actually took bytes (a detached host has none), which is
    /// what decides whether a pending pty-fd handoff happened.
    pub fn copy_a_bit(
        &mut self,
        in_fd: RawFd,
        out_fd: Option<RawFd>,
        dribble: Option<RawFd>,
        send_fd: Option<RawFd>,
        want_fd: Option<&mut Option<OwnedFd>>,
    ) -> io::Result<CopyOutcome> {
        let read = self.fill_from(in_fd, dribble, want_fd)?;
        if read == 0 {
            return Ok(CopyOutcome { read: 0, written: 0 });
        }
        let written = match self.drain_to(out_fd, send_fd)? {
            DrainStatus::Written(n) => n,
            DrainStatus::PeerClosed => 0,
        };
        Ok(CopyOutcome { read, written })
    }
}

/// Write all of `data` to `fd`, retrying on EINTR.
fn write_all(fd: RawFd, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, data) {
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream;

    fn ignore_sigpipe() {
        use nix::sys::signal::{signal, SigHandler, Signal};
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.expect("ignore SIGPIPE");
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn bytes_pass_through_verbatim() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        let (c, mut d) = UnixStream::pair().expect("socketpair");

        use std::io::Write;
        a.write_all(b"hello\r").expect("write");

        let mut relay = ReplayBuffer::new();
        let outcome = relay
            .copy_a_bit(b.as_raw_fd(), Some(c.as_raw_fd()), None, None, None)
            .expect("copy");
        assert_eq!(outcome.read, 6);
        assert_eq!(outcome.written, 6);

        let mut got = [0u8; 6];
        d.read_exact(&mut got).expect("read");
        assert_eq!(&got, b"hello\r");
    }

    #[test]
    fn eof_read_preserves_replay_slot() {
        let (a, b) = UnixStream::pair().expect("socketpair");

        use std::io::Write;
        (&a).write_all(b"> ").expect("write");

        let mut relay = ReplayBuffer::new();
        let n = relay.fill_from(b.as_raw_fd(), None, None).expect("fill");
        assert_eq!(n, 2);

        drop(a);
        let n = relay.fill_from(b.as_raw_fd(), None, None).expect("fill at EOF");
        assert_eq!(n, 0);
        assert_eq!(relay.last_read(), b"> ");
    }

    #[test]
    fn replay_drain_repeats_last_chunk() {
        let (a, b) = UnixStream::pair().expect("socketpair");

        use std::io::Write;
        (&a).write_all(b"AB").expect("write");

        let mut relay = ReplayBuffer::new();
        relay.fill_from(b.as_raw_fd(), None, None).expect("fill");

        // Two successive "attachers" both see AB.
        for _ in 0..2 {
            let (c, mut d) = UnixStream::pair().expect("socketpair");
            let status = relay
                .drain_to(Some(c.as_raw_fd()), None)
                .expect("drain");
            assert_eq!(status, DrainStatus::Written(2));
            let mut got = [0u8; 2];
            d.read_exact(&mut got).expect("read");
            assert_eq!(&got, b"AB");
        }
    }

    #[test]
    fn dribble_tees_every_filled_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dribble");
        let dribble = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .expect("open dribble");

        let (a, b) = UnixStream::pair().expect("socketpair");
        use std::io::Write;
        (&a).write_all(b"one").expect("write");

        let mut relay = ReplayBuffer::new();
        relay
            .fill_from(b.as_raw_fd(), Some(dribble.as_raw_fd()), None)
            .expect("fill");

        (&a).write_all(b"two").expect("write");
        relay
            .fill_from(b.as_raw_fd(), Some(dribble.as_raw_fd()), None)
            .expect("fill");

        assert_eq!(std::fs::read(&path).expect("read dribble"), b"onetwo");
        // The slot only holds the latest chunk.
        assert_eq!(relay.last_read(), b"two");
    }

    #[test]
    fn drain_to_closed_peer_reports_peer_closed() {
        ignore_sigpipe();
        let (a, b) = UnixStream::pair().expect("socketpair");
        drop(b);

        let (src, sink) = UnixStream::pair().expect("socketpair");
        use std::io::Write;
        (&src).write_all(b"doomed").expect("write");

        let mut relay = ReplayBuffer::new();
        relay.fill_from(sink.as_raw_fd(), None, None).expect("fill");
        let status = relay.drain_to(Some(a.as_raw_fd()), None).expect("drain");
        assert_eq!(status, DrainStatus::PeerClosed);
    }

    #[test]
    fn fd_handoff_rides_first_byte_of_drain() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let (pipe_read, pipe_write) = pipe();

        let (src, sink) = UnixStream::pair().expect("socketpair");
        use std::io::Write;
        (&src).write_all(b"> hello").expect("write");

        let mut relay = ReplayBuffer::new();
        relay.fill_from(sink.as_raw_fd(), None, None).expect("fill");
        let status = relay
            .drain_to(Some(a.as_raw_fd()), Some(pipe_write.as_raw_fd()))
            .expect("drain");
        assert_eq!(status, DrainStatus::Written(7));

        // Receive the way the attacher does: ancillary-aware until the fd shows up.
        let mut receiver = ReplayBuffer::new();
        let mut got_fd: Option<OwnedFd> = None;
        let n = receiver
            .fill_from(b.as_raw_fd(), None, Some(&mut got_fd))
            .expect("fill");
        assert!(n >= 1);
        let got_fd = got_fd.expect("fd should arrive with the first byte");

        // The transferred descriptor is usable.
        let written = unsafe {
            libc::write(got_fd.as_raw_fd(), b"ok".as_ptr() as *const libc::c_void, 2)
        };
        assert_eq!(written, 2);
        let mut buf = [0u8; 2];
        let r = unsafe {
            libc::read(pipe_read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 2)
        };
        assert_eq!(r, 2);
        assert_eq!(&buf, b"ok");

        // Collect the rest of the payload, if the first recv was short.
        let mut total = n;
        while total < 7 {
            let m = receiver.fill_from(b.as_raw_fd(), None, None).expect("fill rest");
            assert!(m > 0);
            total += m;
        }
        assert_eq!(total, 7);
    }
}
