//! Attacher side: make the invoking terminal transparent and relay
//! everything to and from the host.
//!
//! Two modes. Interactive relays stdin/stdout indefinitely. Scripted writes
//! a given text (plus a terminating carriage return), forwards whatever
//! comes back, and gives up when a wall-clock deadline passes. In both
//! modes the receive path stays ancillary-aware until the host's pty fd
//! shows up, at which point the attacher pushes its window size onto it and
//! goes back to plain reads.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{self, getpid};
use tracing::info;

use crate::relay::ReplayBuffer;
use crate::rendezvous;
use crate::signals;
use crate::term::{self, AttachedTerminal};

pub enum AttachMode {
    Interactive,
    Scripted { text: String, timeout: Duration },
}

struct Script {
    bytes: Vec<u8>,
    sent: usize,
    done: bool,
}

/// Connect, go raw, relay until the session ends, restore.
pub fn run(socket_path: &Path, mode: AttachMode) -> Result<()> {
    let server = rendezvous::connect_to(socket_path)?;

    // Absent when stdin is not a terminal (scripted use from a pipeline);
    // everything else works the same, there is just nothing to restore.
    let tty = AttachedTerminal::enter().ok();

    relay_loop(server.as_raw_fd(), &tty, mode)
}

fn relay_loop(server: RawFd, tty: &Option<AttachedTerminal>, mode: AttachMode) -> Result<()> {
    let mut replay = ReplayBuffer::new();
    let mut pty_master: Option<OwnedFd> = None;
    let mut awaiting_fd = true;

    let (mut script, deadline) = match mode {
        AttachMode::Scripted { text, timeout } => (
            Some(Script {
                bytes: text.into_bytes(),
                sent: 0,
                done: false,
            }),
            Some(Instant::now() + timeout),
        ),
        AttachMode::Interactive => (None, None),
    };

    while signals::FATAL_SIGNAL.load(Ordering::Relaxed) == 0 {
        drain_flags(server, &pty_master, tty);

        let mut server_events = PollFlags::POLLIN;
        if script.as_ref().is_some_and(|s| !s.done) {
            server_events |= PollFlags::POLLOUT;
        }
        let mut fds = vec![PollFd::new(
            unsafe { BorrowedFd::borrow_raw(server) },
            server_events,
        )];
        if script.is_none() {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(STDIN_FILENO) },
                PollFlags::POLLIN | PollFlags::POLLHUP,
            ));
        }

        let timeout = match deadline {
            Some(d) => {
                let ms = d
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u128::from(u16::MAX)) as u16;
                PollTimeout::from(ms)
            }
            None => PollTimeout::NONE,
        };

        match poll(&mut fds, timeout) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("poll"),
            Ok(_) => {}
        }

        let server_revents = fds[0].revents().unwrap_or(PollFlags::empty());
        let stdin_revents = fds
            .get(1)
            .and_then(|f| f.revents())
            .unwrap_or(PollFlags::empty());
        drop(fds);

        if server_revents.contains(PollFlags::POLLIN) {
            let want = if awaiting_fd { Some(&mut pty_master) } else { None };
            match replay.copy_a_bit(server, Some(STDOUT_FILENO), None, None, want) {
                Ok(outcome) if outcome.read == 0 => {
                    info!("end-of-file while copying from socket, exiting");
                    break;
                }
                Ok(_) => {
                    // First sight of the pty fd: push our geometry at once,
                    // then stop asking for ancillary data.
                    if awaiting_fd {
                        if let Some(fd) = &pty_master {
                            term::send_window_size(fd.as_raw_fd());
                            awaiting_fd = false;
                        }
                    }
                }
                Err(e) => {
                    info!("error copying from socket: {}, exiting", e);
                    break;
                }
            }
        }

        match script.as_mut() {
            Some(s) => {
                if server_revents.contains(PollFlags::POLLOUT) && !s.done {
                    match unistd::write(unsafe { BorrowedFd::borrow_raw(server) }, &s.bytes[s.sent..])
                    {
                        Ok(n) => {
                            s.sent += n;
                            if s.sent >= s.bytes.len() {
                                let _ = unistd::write(
                                    unsafe { BorrowedFd::borrow_raw(server) },
                                    b"\r",
                                );
                                s.done = true;
                            }
                        }
                        Err(Errno::EINTR | Errno::EAGAIN) => {}
                        Err(Errno::EPIPE) => s.done = true,
                        Err(e) => return Err(e).context("write script text"),
                    }
                }
                // The deadline is the wall clock, not the poll timeout.
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
            None => {
                if stdin_revents.contains(PollFlags::POLLIN) {
                    match replay.copy_a_bit(STDIN_FILENO, Some(server), None, None, None) {
                        Ok(outcome) if outcome.read == 0 => {
                            info!("end-of-file while copying to socket, exiting");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            info!("error copying to socket: {}, exiting", e);
                            break;
                        }
                    }
                }
                if stdin_revents.contains(PollFlags::POLLHUP) {
                    info!("closed connection due to hangup, exiting");
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Act on the signal flags the handlers left for us.
fn drain_flags(server: RawFd, pty_master: &Option<OwnedFd>, tty: &Option<AttachedTerminal>) {
    if signals::INTERRUPTED.swap(false, Ordering::Relaxed) {
        let _ = unistd::write(unsafe { BorrowedFd::borrow_raw(server) }, b"\x03");
    }
    if signals::SUSPENDED.swap(false, Ordering::Relaxed) {
        suspend_self(tty);
    }
    if signals::RESIZED.swap(false, Ordering::Relaxed) {
        // Dropped while the pty fd hasn't arrived; the explicit push on fd
        // receipt covers the initial geometry.
        if let Some(fd) = pty_master {
            term::send_window_size(fd.as_raw_fd());
        }
    }
}

/// SIGTSTP, taken outside signal context: hand the terminal back, really
/// stop, and redo the raw setup once SIGCONT gets us going again.
fn suspend_self(tty: &Option<AttachedTerminal>) {
    if let Some(t) = tty {
        let _ = t.restore();
    }
    let _ = signals::reset_to_default(Signal::SIGTSTP);
    let _ = kill(getpid(), Signal::SIGTSTP);

    // Execution resumes here after SIGCONT.
    let _ = signals::install_tstp_handler();
    if let Some(t) = tty {
        let _ = t.reapply();
    }
}
