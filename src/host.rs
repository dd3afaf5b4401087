//! Host side: the three-way multiplex among child pty, listening socket,
//! and at-most-one attached client.
//!
//! Everything the child prints goes to the attached client (when there is
//! one) and to the dribble file (when configured); everything the client
//! sends goes to the child's pty. A newly accepted client displaces any
//! previous one and is immediately served the replay slot, with the pty
//! master fd riding the first byte so the attacher can propagate window
//! sizes on its own.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::accept;
use nix::sys::wait::{waitpid, WaitPidFlag};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use crate::logging::LogSink;
use crate::pty::PtyChild;
use crate::relay::{DrainStatus, ReplayBuffer};
use crate::signals;

pub struct HostOptions {
    /// Rendezvous path as actually bound (already truncated), for unlink.
    pub socket_path: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub dribble_path: Option<PathBuf>,
    pub log_sink: LogSink,
}

pub struct Host {
    listen: OwnedFd,
    pty: PtyChild,
    client: Option<OwnedFd>,
    /// The pty master fd is owed to the current client until some bytes
    /// actually reach it.
    owes_pty_fd: bool,
    dribble: Option<File>,
    replay: ReplayBuffer,
    opts: HostOptions,
}

/// Open (or reopen) the transcript file: append-only, private.
pub fn open_dribble(path: &PathBuf) -> Option<File> {
    match OpenOptions::new()
        .write(true)
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!("cannot open dribble file {}: {}", path.display(), e);
            None
        }
    }
}

impl Host {
    pub fn new(listen: OwnedFd, pty: PtyChild, opts: HostOptions) -> Self {
        let dribble = opts.dribble_path.as_ref().and_then(open_dribble);
        Self {
            listen,
            pty,
            client: None,
            owes_pty_fd: false,
            dribble,
            replay: ReplayBuffer::new(),
            opts,
        }
    }

    /// The event loop. Leaves only through [`Host::tidy`].
    pub fn run(mut self) -> ! {
        info!("successfully started");
        loop {
            self.drain_signals();

            let pty_fd = self.pty.master.as_raw_fd();
            let listen_fd = self.listen.as_raw_fd();
            let client_fd = self.client.as_ref().map(|c| c.as_raw_fd());

            let mut fds = vec![
                PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(pty_fd) },
                    PollFlags::POLLIN | PollFlags::POLLHUP,
                ),
                PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(listen_fd) },
                    PollFlags::POLLIN,
                ),
            ];
            if let Some(fd) = client_fd {
                fds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(fd) },
                    PollFlags::POLLIN | PollFlags::POLLHUP,
                ));
            }

            match poll(&mut fds, PollTimeout::NONE) {
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(e) => {
                    warn!("poll failed: {}", e);
                    continue;
                }
                Ok(_) => {}
            }

            self.drain_signals();

            let pty_revents = fds[0].revents().unwrap_or(PollFlags::empty());
            let listen_revents = fds[1].revents().unwrap_or(PollFlags::empty());
            let client_revents = fds
                .get(2)
                .and_then(|f| f.revents())
                .unwrap_or(PollFlags::empty());
            drop(fds);

            if pty_revents.contains(PollFlags::POLLIN) {
                let send_fd = if self.owes_pty_fd { Some(pty_fd) } else { None };
                let dribble = self.dribble_fd();
                match self
                    .replay
                    .copy_a_bit(pty_fd, client_fd, dribble, send_fd, None)
                {
                    Ok(outcome) => {
                        if outcome.written > 0 {
                            self.owes_pty_fd = false;
                        }
                        // A zero read here precedes the POLLHUP we exit on.
                    }
                    Err(e) => {
                        info!("closing connection after write error: {}", e);
                        self.close_client();
                    }
                }
            }
            if pty_revents.contains(PollFlags::POLLHUP) {
                info!("child terminated, exiting");
                self.close_client();
                self.tidy(0);
            }

            if listen_revents.contains(PollFlags::POLLIN) {
                match accept(listen_fd) {
                    Ok(new_fd) => {
                        self.adopt_client(unsafe { OwnedFd::from_raw_fd(new_fd) });
                        // Revents for the displaced client are stale now.
                        continue;
                    }
                    Err(Errno::EINTR | Errno::EAGAIN) => {}
                    Err(e) => warn!("accept failed: {}", e),
                }
            }

            if let Some(fd) = client_fd {
                if self.client.is_some() && client_revents.contains(PollFlags::POLLIN) {
                    let dribble = self.dribble_fd();
                    match self.replay.copy_a_bit(fd, Some(pty_fd), dribble, None, None) {
                        Ok(outcome) if outcome.read == 0 => {
                            info!("end-of-file while copying from socket, closing connection");
                            self.close_client();
                        }
                        Ok(_) => {}
                        Err(e) => {
                            info!("closing connection after error: {}", e);
                            self.close_client();
                        }
                    }
                }
                if self.client.is_some() && client_revents.contains(PollFlags::POLLHUP) {
                    info!("closed connection due to hangup");
                    self.close_client();
                }
            }
        }
    }

    /// Displace any previous client, adopt the new one, and serve it the
    /// replay slot with the pty fd attached to the first byte.
    fn adopt_client(&mut self, new_client: OwnedFd) {
        info!(
            "accepted connection{}",
            if self.client.is_some() {
                " (and closing previous one)"
            } else {
                ""
            }
        );
        let new_fd = new_client.as_raw_fd();
        self.client = Some(new_client);
        self.owes_pty_fd = true;

        let pty_fd = self.pty.master.as_raw_fd();
        match self.replay.drain_to(Some(new_fd), Some(pty_fd)) {
            Ok(DrainStatus::Written(n)) if n > 0 => self.owes_pty_fd = false,
            Ok(_) => {}
            Err(e) => {
                info!("closing connection after replay error: {}", e);
                self.close_client();
            }
        }
    }

    fn close_client(&mut self) {
        self.client = None;
        self.owes_pty_fd = false;
    }

    fn dribble_fd(&self) -> Option<RawFd> {
        self.dribble.as_ref().map(|f| f.as_raw_fd())
    }

    fn drain_signals(&mut self) {
        if let Some(sig) = signals::take_fatal() {
            self.tidy(sig);
        }
        if signals::HANGUP.swap(false, Ordering::Relaxed) {
            self.opts.log_sink.reopen();
            if let Some(path) = &self.opts.dribble_path {
                self.dribble = open_dribble(path);
            }
            info!("got SIGHUP, reopened log and dribble files");
        }
        if signals::CHILD_EXITED.swap(false, Ordering::Relaxed) {
            // Reap; the exit itself is driven by POLLHUP on the pty.
            let _ = waitpid(self.pty.pid, Some(WaitPidFlag::WNOHANG));
        }
    }

    /// Orderly exit: log, unlink the rendezvous artifacts, exit with the
    /// signal number (0 for a clean child exit).
    fn tidy(&mut self, sig: i32) -> ! {
        if sig != 0 {
            info!("got signal {}, exiting", sig);
        } else {
            info!("exiting");
        }
        if let Err(e) = std::fs::remove_file(&self.opts.socket_path) {
            warn!(
                "error unlinking \"{}\": {}",
                self.opts.socket_path.display(),
                e
            );
        }
        if let Some(pid_file) = &self.opts.pid_file {
            if let Err(e) = std::fs::remove_file(pid_file) {
                warn!("error unlinking \"{}\": {}", pid_file.display(), e);
            }
        }
        std::process::exit(sig);
    }
}
