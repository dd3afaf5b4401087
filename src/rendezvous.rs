//! The filesystem rendezvous: a Unix stream socket the host listens on and
//! attachers connect to.
//!
//! The socket file is created mode 0600 (filesystem permissions are the only
//! access control) with a backlog of 1. A crashed host leaves the path
//! behind; when a pid file is configured, a fresh host probes the recorded
//! pid and reclaims the path if that process is gone.

use std::ffi::OsStr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::socket::{
    bind, connect, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use nix::sys::stat::{umask, Mode};
use nix::unistd::Pid;
use tracing::info;

/// Safe portable limit for sun_path; longer paths are silently truncated.
pub const SUN_PATH_MAX: usize = 107;

/// Truncate `path` to what fits in a sockaddr_un.
pub fn truncated_socket_path(path: &Path) -> PathBuf {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() <= SUN_PATH_MAX {
        path.to_path_buf()
    } else {
        PathBuf::from(OsStr::from_bytes(&bytes[..SUN_PATH_MAX]))
    }
}

/// Bind the rendezvous socket and listen with backlog 1.
///
/// One recovery step on bind failure: if `pid_file` names a pid that no
/// longer exists, the stale socket path is unlinked and bind retried once.
/// Everything else is an error for the caller's fatal path.
pub fn bind_and_listen(path: &Path, pid_file: Option<&Path>) -> Result<OwnedFd> {
    let path = truncated_socket_path(path);
    let addr = UnixAddr::new(&path).context("socket address")?;
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("socket")?;

    let old_umask = umask(Mode::from_bits_truncate(0o077));
    let mut bound = bind(sock.as_raw_fd(), &addr);
    if bound.is_err() && reclaim_stale_socket(&path, pid_file) {
        bound = bind(sock.as_raw_fd(), &addr);
    }
    umask(old_umask);

    bound.with_context(|| {
        format!(
            "cannot create \"{}\": does it already exist from a previous run?",
            path.display()
        )
    })?;

    // Backlog 1: a second attacher queues just long enough to displace the
    // first on the next accept.
    listen(&sock, Backlog::new(1).context("backlog")?).context("listen")?;
    Ok(sock)
}

/// Connect to a host's rendezvous socket.
pub fn connect_to(path: &Path) -> Result<OwnedFd> {
    let path = truncated_socket_path(path);
    let addr = UnixAddr::new(&path).context("socket address")?;
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("socket")?;
    connect(sock.as_raw_fd(), &addr)
        .with_context(|| format!("connect to \"{}\"", path.display()))?;
    Ok(sock)
}

/// True when the previous run is provably gone and its socket was removed.
fn reclaim_stale_socket(path: &Path, pid_file: Option<&Path>) -> bool {
    let pid_file = match pid_file {
        Some(p) => p,
        None => return false,
    };
    let recorded = std::fs::read_to_string(pid_file)
        .ok()
        .and_then(|s| s.lines().next().map(str::trim).and_then(|l| l.parse::<i32>().ok()))
        .filter(|&pid| pid > 0);
    let pid = match recorded {
        Some(pid) => pid,
        None => return false,
    };

    // Signal 0: existence probe only.
    match kill(Pid::from_raw(pid), None) {
        Err(Errno::ESRCH) => {}
        _ => {
            info!("process {pid} for pid file \"{}\" is still running", pid_file.display());
            return false;
        }
    }

    if std::fs::remove_file(path).is_err() {
        return false;
    }
    info!(
        "found and removed stale socket \"{}\" from a previous run",
        path.display()
    );
    true
}
