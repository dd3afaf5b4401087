//! Signal discipline shared by both executables.
//!
//! Handlers set atomic flags and nothing else; each event loop drains the
//! flags at the top of every iteration and again right after poll returns.
//! Fatal signals are installed with SA_RESETHAND so a second delivery hits
//! the default disposition and really kills the process.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Signal number of a pending fatal signal; 0 when none.
pub static FATAL_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Host: SIGHUP requests a log/dribble reopen.
pub static HANGUP: AtomicBool = AtomicBool::new(false);

/// Host: SIGCHLD, drained by reaping.
pub static CHILD_EXITED: AtomicBool = AtomicBool::new(false);

/// Attacher: SIGINT, forwarded as 0x03 over the link.
pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Attacher: SIGTSTP, triggers the restore-stop-resume cycle.
pub static SUSPENDED: AtomicBool = AtomicBool::new(false);

/// Attacher: SIGWINCH, re-propagated onto the received pty fd.
pub static RESIZED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_fatal(sig: libc::c_int) {
    FATAL_SIGNAL.store(sig, Ordering::Relaxed);
}

extern "C" fn on_hangup(_sig: libc::c_int) {
    HANGUP.store(true, Ordering::Relaxed);
}

extern "C" fn on_child(_sig: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::Relaxed);
}

extern "C" fn on_interrupt(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

extern "C" fn on_suspend(_sig: libc::c_int) {
    SUSPENDED.store(true, Ordering::Relaxed);
}

extern "C" fn on_resize(_sig: libc::c_int) {
    RESIZED.store(true, Ordering::Relaxed);
}

fn install(sig: Signal, handler: SigHandler, flags: SaFlags) -> nix::Result<()> {
    let act = SigAction::new(handler, flags, SigSet::empty());
    unsafe { sigaction(sig, &act) }?;
    Ok(())
}

const FATAL_SIGNALS: &[Signal] = &[
    Signal::SIGQUIT,
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGTERM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
];

/// Host set: fatal flag for the tidy-up set, SIGHUP reopens files, SIGCHLD
/// reaps, SIGPIPE ignored (EPIPE is handled where it happens).
pub fn install_host_handlers() -> nix::Result<()> {
    for &sig in FATAL_SIGNALS {
        install(sig, SigHandler::Handler(on_fatal), SaFlags::SA_RESETHAND)?;
    }
    install(Signal::SIGHUP, SigHandler::Handler(on_hangup), SaFlags::empty())?;
    install(Signal::SIGCHLD, SigHandler::Handler(on_child), SaFlags::empty())?;
    install(Signal::SIGPIPE, SigHandler::SigIgn, SaFlags::empty())?;
    Ok(())
}

/// Attacher set: SIGINT/SIGWINCH/SIGTSTP become flags, everything else
/// fatal-flags the loop so the terminal gets restored on the way out.
pub fn install_attacher_handlers() -> nix::Result<()> {
    for &sig in FATAL_SIGNALS {
        install(sig, SigHandler::Handler(on_fatal), SaFlags::SA_RESETHAND)?;
    }
    install(Signal::SIGHUP, SigHandler::Handler(on_fatal), SaFlags::SA_RESETHAND)?;
    install(Signal::SIGCHLD, SigHandler::Handler(on_fatal), SaFlags::SA_RESETHAND)?;
    install(Signal::SIGINT, SigHandler::Handler(on_interrupt), SaFlags::empty())?;
    install(Signal::SIGWINCH, SigHandler::Handler(on_resize), SaFlags::empty())?;
    install_tstp_handler()?;
    install(Signal::SIGPIPE, SigHandler::SigIgn, SaFlags::empty())?;
    Ok(())
}

/// (Re-)arm the SIGTSTP flag handler. One-shot: the suspend cycle restores
/// the default disposition before stopping and re-arms after SIGCONT.
pub fn install_tstp_handler() -> nix::Result<()> {
    install(
        Signal::SIGTSTP,
        SigHandler::Handler(on_suspend),
        SaFlags::SA_RESETHAND,
    )
}

/// Put a signal back to its default disposition.
pub fn reset_to_default(sig: Signal) -> nix::Result<()> {
    install(sig, SigHandler::SigDfl, SaFlags::empty())
}

/// Consume the pending fatal signal, if any.
pub fn take_fatal() -> Option<i32> {
    match FATAL_SIGNAL.swap(0, Ordering::Relaxed) {
        0 => None,
        sig => Some(sig),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn fatal_flag_set_and_consumed() {
        install_host_handlers().expect("install");
        raise(Signal::SIGTERM).expect("raise");
        assert_eq!(take_fatal(), Some(libc::SIGTERM));
        assert_eq!(take_fatal(), None);

        // SA_RESETHAND dropped the handler; re-arm before anything else uses it.
        install_host_handlers().expect("reinstall");
    }

    #[test]
    fn hangup_flag_is_sticky_until_drained() {
        install_host_handlers().expect("install");
        raise(Signal::SIGHUP).expect("raise");
        assert!(HANGUP.swap(false, Ordering::Relaxed));
        assert!(!HANGUP.load(Ordering::Relaxed));
    }
}
