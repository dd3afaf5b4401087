//! Attacher-side terminal state and window-size plumbing.
//!
//! While attached, the invoking terminal runs in "raw attach mode": no
//! canonical processing, no echo, no flow control, newline translation left
//! to the far side's line discipline. The saved settings are reapplied with
//! drain semantics on every way out, including the SIGTSTP stop/resume
//! cycle.

use std::os::fd::{BorrowedFd, RawFd};

use nix::libc::STDIN_FILENO;
use nix::pty::Winsize;
use nix::sys::termios::{
    tcgetattr, tcsetattr, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};

const VDISABLE: u8 = 0;

fn stdin_fd() -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(STDIN_FILENO) }
}

/// Derive the raw attach settings from a saved termios.
pub fn raw_attach_settings(saved: &Termios) -> Termios {
    let mut tty = saved.clone();
    tty.input_flags.remove(
        InputFlags::INLCR
            | InputFlags::ICRNL
            | InputFlags::IGNCR
            | InputFlags::IXON
            | InputFlags::IXOFF,
    );
    tty.output_flags
        .remove(OutputFlags::OCRNL | OutputFlags::ONOCR | OutputFlags::ONLRET);
    // Keep NL -> CR-NL mapping so remote output doesn't staircase.
    tty.output_flags.insert(OutputFlags::ONLCR);
    tty.local_flags
        .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::IEXTEN);
    tty.control_chars[SpecialCharacterIndices::VSTART as usize] = VDISABLE;
    tty.control_chars[SpecialCharacterIndices::VSTOP as usize] = VDISABLE;
    tty
}

/// The invoking terminal, captured at attach time.
///
/// `Drop` restores the saved settings, so the terminal comes back whether
/// the loop ends by EOF, deadline, or a caught fatal signal.
pub struct AttachedTerminal {
    saved: Termios,
}

impl AttachedTerminal {
    /// Capture the current settings and switch to raw attach mode.
    pub fn enter() -> nix::Result<Self> {
        let saved = tcgetattr(stdin_fd())?;
        let this = Self { saved };
        this.reapply()?;
        Ok(this)
    }

    /// Apply raw attach mode (again). Used on entry and after SIGCONT.
    pub fn reapply(&self) -> nix::Result<()> {
        tcsetattr(stdin_fd(), SetArg::TCSADRAIN, &raw_attach_settings(&self.saved))
    }

    /// Put the saved settings back. Used before suspending and on exit.
    pub fn restore(&self) -> nix::Result<()> {
        tcsetattr(stdin_fd(), SetArg::TCSADRAIN, &self.saved)
    }
}

impl Drop for AttachedTerminal {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// Current dimensions of the terminal behind `fd`, if it is one.
pub fn window_size(fd: RawFd) -> Option<Winsize> {
    let mut size: Winsize = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) };
    if ret == 0 {
        Some(size)
    } else {
        None
    }
}

/// Push `size` onto the terminal behind `fd`.
pub fn set_window_size(fd: RawFd, size: &Winsize) -> bool {
    unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, size) == 0 }
}

/// Copy the local terminal's dimensions onto the received pty fd.
///
/// The line discipline delivers the matching SIGWINCH to the child's
/// process group on its own.
pub fn send_window_size(pty_fd: RawFd) -> bool {
    match window_size(STDIN_FILENO) {
        Some(size) => set_window_size(pty_fd, &size),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;
    use std::os::fd::AsRawFd;

    #[test]
    fn raw_attach_settings_disable_line_processing() {
        // A real termios to start from, without assuming the test runner
        // has a controlling terminal.
        let pty = openpty(None, None).expect("openpty");
        let base = tcgetattr(&pty.slave).expect("tcgetattr");

        let raw = raw_attach_settings(&base);
        assert!(!raw.input_flags.intersects(
            InputFlags::INLCR
                | InputFlags::ICRNL
                | InputFlags::IGNCR
                | InputFlags::IXON
                | InputFlags::IXOFF
        ));
        assert!(!raw
            .output_flags
            .intersects(OutputFlags::OCRNL | OutputFlags::ONOCR | OutputFlags::ONLRET));
        assert!(raw.output_flags.contains(OutputFlags::ONLCR));
        assert!(!raw
            .local_flags
            .intersects(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::IEXTEN));
        assert_eq!(raw.control_chars[SpecialCharacterIndices::VSTART as usize], 0);
        assert_eq!(raw.control_chars[SpecialCharacterIndices::VSTOP as usize], 0);
    }

    #[test]
    fn window_size_round_trips_on_a_pty() {
        let pty = openpty(None, None).expect("openpty");
        let size = Winsize {
            ws_row: 34,
            ws_col: 111,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        assert!(set_window_size(pty.master.as_raw_fd(), &size));
        let got = window_size(pty.slave.as_raw_fd()).expect("window_size");
        assert_eq!(got.ws_row, 34);
        assert_eq!(got.ws_col, 111);
    }
}
