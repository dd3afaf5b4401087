//! Pty allocation and child bring-up for the host.
//!
//! The equivalent of forkpty: open a pty pair, fork, and in the child make
//! the slave the controlling terminal on fds 0/1/2 before exec'ing the
//! target command. The slave starts in canonical mode with echo off, which
//! is what a line-editing REPL behind a detached terminal expects.

use std::ffi::{CString, OsString};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{Context, Result};
use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{
    tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};
use nix::unistd::{chdir, close, dup2, execv, fork, setsid, ForkResult, Pid};

pub struct PtyChild {
    pub master: OwnedFd,
    pub pid: Pid,
}

/// Canonical-with-no-echo settings for the slave side.
///
/// ECHO and friends come off (the attacher's terminal does its own echo),
/// ICANON stays on, and erase is DEL — the traditional REPL arrangement.
pub fn child_line_settings(base: &Termios) -> Termios {
    let mut tty = base.clone();
    tty.local_flags.remove(
        LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK | LocalFlags::ECHONL,
    );
    tty.local_flags.insert(LocalFlags::ICANON);
    tty.control_chars[SpecialCharacterIndices::VERASE as usize] = 0o177;
    tty
}

/// Open a pty pair and start `command` on the slave side.
///
/// `termios`/`winsize` seed the slave with the invoking terminal's settings
/// when the host was started from one. The parent gets the master fd and the
/// child pid; the child never returns (exec or `_exit`).
pub fn spawn_on_pty(
    command: &Path,
    args: &[OsString],
    termios: Option<&Termios>,
    winsize: Option<&Winsize>,
) -> Result<PtyChild> {
    let pty = openpty(winsize, termios).context("openpty")?;

    // Exec arguments are prepared before fork; the child only makes
    // async-signal-safe calls after it.
    let cmd = CString::new(command.as_os_str().as_bytes()).context("command path")?;
    let mut argv = vec![cmd.clone()];
    for arg in args {
        argv.push(CString::new(arg.as_bytes()).context("command argument")?);
    }

    match unsafe { fork() }.context("fork")? {
        ForkResult::Child => {
            drop(pty.master);
            let slave_fd = pty.slave.as_raw_fd();

            let _ = setsid();
            unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) };

            let _ = dup2(slave_fd, STDIN_FILENO);
            let _ = dup2(slave_fd, STDOUT_FILENO);
            let _ = dup2(slave_fd, STDERR_FILENO);
            if slave_fd > STDERR_FILENO {
                drop(pty.slave);
            } else {
                let _ = pty.slave.into_raw_fd();
            }

            if let Ok(tty) = tcgetattr(unsafe { std::os::fd::BorrowedFd::borrow_raw(STDIN_FILENO) })
            {
                let _ = tcsetattr(
                    unsafe { std::os::fd::BorrowedFd::borrow_raw(STDIN_FILENO) },
                    SetArg::TCSANOW,
                    &child_line_settings(&tty),
                );
            }

            let _ = execv(&cmd, &argv);
            // Exec failed; stderr is the pty, so the next attacher sees this.
            eprintln!("detachtty: exec {} failed", command.display());
            unsafe { libc::_exit(1) }
        }
        ForkResult::Parent { child } => {
            drop(pty.slave);
            Ok(PtyChild {
                master: pty.master,
                pid: child,
            })
        }
    }
}

/// Detach from the invoking terminal: double-fork, new session, root cwd,
/// stdin/stdout onto /dev/null. Stderr is left alone so a user who omitted
/// --log-file still sees diagnostics.
pub fn daemonize() -> Result<()> {
    match unsafe { fork() }.context("first daemon fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;
    match unsafe { fork() }.context("second daemon fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    chdir("/").context("chdir /")?;

    let dev_null = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
    if dev_null < 0 {
        return Err(std::io::Error::last_os_error()).context("open /dev/null");
    }
    dup2(dev_null, STDIN_FILENO).context("dup2 stdin")?;
    dup2(dev_null, STDOUT_FILENO).context("dup2 stdout")?;
    if dev_null > STDOUT_FILENO {
        let _ = close(dev_null);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;

    #[test]
    fn child_line_settings_keep_canon_drop_echo() {
        let pty = openpty(None, None).expect("openpty");
        let base = tcgetattr(&pty.slave).expect("tcgetattr");

        let tty = child_line_settings(&base);
        assert!(tty.local_flags.contains(LocalFlags::ICANON));
        assert!(!tty.local_flags.intersects(
            LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK | LocalFlags::ECHONL
        ));
        assert_eq!(
            tty.control_chars[SpecialCharacterIndices::VERASE as usize],
            0o177
        );
    }
}
